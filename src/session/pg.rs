//! Production [`SourceSession`] over the `postgres` crate.
//!
//! Every statement goes through the simple-query protocol, so values come
//! back as text and no binary type mapping is involved; LSNs and xids are
//! parsed from their textual forms. Parameters are inlined with literal
//! escaping, which the few quoted values here (labels, restore point names)
//! tolerate.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use postgres::{Client, Config, NoTls, SimpleQueryMessage};
use tracing::debug;

use crate::pg::lsn::Lsn;
use crate::session::{ConnectionOptions, PtrackPagemap, SourceSession, StopBackupResult};
use crate::{Error, Result};

pub struct PgSession {
    client: Client,
    server_version: u32,
}

/// Double the quotes in a string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn parse_lsn(text: &str) -> Result<Lsn> {
    Lsn::from_str(text).map_err(|err| Error::Protocol(err.to_string()).into())
}

fn field(row: &[Option<String>], index: usize) -> Option<String> {
    row.get(index).cloned().flatten()
}

impl PgSession {
    pub fn connect(opts: &ConnectionOptions) -> Result<PgSession> {
        let mut config = Config::new();
        config.host(opts.host.as_deref().unwrap_or("localhost"));
        config.port(opts.port.unwrap_or(5432));
        config.dbname(opts.database.as_deref().unwrap_or("postgres"));
        match &opts.user {
            Some(user) => {
                config.user(user);
            }
            None => {
                if let Ok(user) = std::env::var("USER") {
                    config.user(&user);
                }
            }
        }
        config.application_name("pgcatchup");

        let client = config
            .connect(NoTls)
            .map_err(|err| Error::Protocol(err.to_string()))?;
        let mut session = PgSession {
            client,
            server_version: 0,
        };
        session.server_version = session
            .query_single("SELECT current_setting('server_version_num')")?
            .parse()
            .map_err(|_| Error::Protocol("unreadable server_version_num".into()))?;
        Ok(session)
    }

    /// Run a statement and collect its rows as owned text values.
    fn simple(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        debug!(sql, "source query");
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|err| Error::Protocol(err.to_string()))?;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut values = Vec::with_capacity(row.len());
                for index in 0..row.len() {
                    values.push(row.get(index).map(str::to_string));
                }
                rows.push(values);
            }
        }
        Ok(rows)
    }

    /// Run a query expected to produce exactly one row and column.
    fn query_single(&mut self, sql: &str) -> Result<String> {
        let rows = self.simple(sql)?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol(format!("no rows from: {sql}")))?;
        row.first()
            .cloned()
            .flatten()
            .ok_or_else(|| Error::Protocol(format!("null result from: {sql}")).into())
    }

    fn wal_dir_name(&self) -> &'static str {
        if self.server_version >= 100000 {
            "pg_wal"
        } else {
            "pg_xlog"
        }
    }

    /// Exclusive start/stop variants are all that exists before 9.6.
    fn exclusive_backup(&self) -> bool {
        self.server_version < 90600
    }
}

impl SourceSession for PgSession {
    fn server_version_num(&mut self) -> Result<u32> {
        Ok(self.server_version)
    }

    fn server_version_str(&mut self) -> Result<String> {
        self.query_single("SELECT current_setting('server_version')")
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(self.query_single("SELECT pg_catalog.pg_is_in_recovery()")? == "t")
    }

    fn is_superuser(&mut self) -> Result<bool> {
        Ok(self.query_single("SELECT current_setting('is_superuser')")? == "on")
    }

    fn system_identifier(&mut self) -> Result<u64> {
        let text =
            self.query_single("SELECT system_identifier FROM pg_catalog.pg_control_system()")?;
        text.parse()
            .map_err(|_| Error::Protocol(format!("unreadable system identifier: {text}")).into())
    }

    fn current_timeline(&mut self) -> Result<u32> {
        let text =
            self.query_single("SELECT timeline_id FROM pg_catalog.pg_control_checkpoint()")?;
        text.parse()
            .map_err(|_| Error::Protocol(format!("unreadable timeline id: {text}")).into())
    }

    fn ptrack_version(&mut self) -> Result<Option<(String, String)>> {
        let rows = self.simple(
            "SELECT e.extversion, n.nspname \
             FROM pg_catalog.pg_extension e \
             JOIN pg_catalog.pg_namespace n ON n.oid = e.extnamespace \
             WHERE e.extname = 'ptrack'",
        )?;
        match rows.first() {
            Some(row) => {
                let version = field(row, 0)
                    .ok_or_else(|| Error::Protocol("null ptrack version".into()))?;
                let schema =
                    field(row, 1).ok_or_else(|| Error::Protocol("null ptrack schema".into()))?;
                Ok(Some((version, schema)))
            }
            None => Ok(None),
        }
    }

    fn ptrack_enabled(&mut self) -> Result<bool> {
        // The GUC does not exist when the shared library is not loaded.
        match self.query_single("SELECT current_setting('ptrack.map_size', true)") {
            Ok(value) => Ok(!matches!(value.as_str(), "" | "0" | "-1")),
            Err(_) => Ok(false),
        }
    }

    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>> {
        let rows = self.simple(
            "SELECT pg_catalog.pg_tablespace_location(oid) \
             FROM pg_catalog.pg_tablespace \
             WHERE pg_catalog.pg_tablespace_location(oid) <> ''",
        )?;
        let mut locations = Vec::with_capacity(rows.len());
        for row in &rows {
            let path = field(row, 0)
                .ok_or_else(|| Error::Protocol("null tablespace location".into()))?;
            locations.push(PathBuf::from(path));
        }
        Ok(locations)
    }

    fn timeline_history(&mut self, tli: u32) -> Result<String> {
        let path = format!("{}/{:08X}.history", self.wal_dir_name(), tli);
        self.query_single(&format!(
            "SELECT pg_catalog.pg_read_file({})",
            quote_literal(&path)
        ))
    }

    fn start_backup(&mut self, label: &str) -> Result<Lsn> {
        let sql = if self.server_version >= 150000 {
            format!(
                "SELECT pg_catalog.pg_backup_start({}, true)",
                quote_literal(label)
            )
        } else if !self.exclusive_backup() {
            format!(
                "SELECT pg_catalog.pg_start_backup({}, true, false)",
                quote_literal(label)
            )
        } else {
            format!(
                "SELECT pg_catalog.pg_start_backup({}, true)",
                quote_literal(label)
            )
        };
        let text = self.query_single(&sql)?;
        parse_lsn(&text)
    }

    fn silence_client_messages(&mut self) -> Result<()> {
        self.simple("SET client_min_messages = warning")?;
        Ok(())
    }

    fn create_restore_point(&mut self, name: &str) -> Result<()> {
        self.query_single(&format!(
            "SELECT pg_catalog.pg_create_restore_point({})",
            quote_literal(name)
        ))?;
        Ok(())
    }

    fn stop_backup(&mut self, from_replica: bool, timeout: Duration) -> Result<StopBackupResult> {
        self.simple(&format!(
            "SET statement_timeout = {}",
            timeout.as_millis().min(i32::MAX as u128)
        ))?;

        let result = if self.exclusive_backup() {
            // The label file lives in the source data directory for the
            // duration of an exclusive window and is removed by the stop call.
            let backup_label = self.query_single("SELECT pg_catalog.pg_read_file('backup_label')")?;
            let lsn_text = self.query_single("SELECT pg_catalog.pg_stop_backup()::text")?;
            StopBackupResult {
                lsn: parse_lsn(&lsn_text)?,
                backup_label,
                tablespace_map: None,
                snapshot_xid: 0,
                invocation_time: chrono::Utc::now(),
            }
        } else {
            let sql = if self.server_version >= 150000 {
                "SELECT lsn::text, labelfile, spcmapfile FROM pg_catalog.pg_backup_stop(true)"
            } else {
                "SELECT lsn::text, labelfile, spcmapfile \
                 FROM pg_catalog.pg_stop_backup(false, true)"
            };
            let rows = self.simple(sql)?;
            let row = rows
                .first()
                .ok_or_else(|| Error::Protocol("empty stop-of-backup result".into()))?;
            if row.len() != 3 {
                return Err(Error::Protocol(format!(
                    "stop-of-backup returned {} fields, expected 3",
                    row.len()
                ))
                .into());
            }
            let lsn_text =
                field(row, 0).ok_or_else(|| Error::Protocol("null stop lsn".into()))?;
            let label =
                field(row, 1).ok_or_else(|| Error::Protocol("null backup label".into()))?;
            let spcmap = field(row, 2).filter(|s| !s.is_empty());
            StopBackupResult {
                lsn: parse_lsn(&lsn_text)?,
                backup_label: label,
                tablespace_map: spcmap,
                snapshot_xid: 0,
                invocation_time: chrono::Utc::now(),
            }
        };

        self.simple("RESET statement_timeout")?;

        let snapshot_xid = if from_replica {
            0
        } else {
            let text = self.query_single("SELECT pg_catalog.txid_current()::text")?;
            text.parse()
                .map_err(|_| Error::Protocol(format!("unreadable xid: {text}")))?
        };

        Ok(StopBackupResult {
            snapshot_xid,
            ..result
        })
    }

    fn ptrack_init_lsn(&mut self, schema: &str) -> Result<Lsn> {
        let text = self.query_single(&format!("SELECT {schema}.ptrack_init_lsn()::text"))?;
        parse_lsn(&text)
    }

    fn ptrack_pagemaps(&mut self, schema: &str, since: Lsn) -> Result<Vec<PtrackPagemap>> {
        let rows = self.simple(&format!(
            "SELECT path, encode(pagemap, 'hex') \
             FROM {schema}.ptrack_get_pagemapset({})",
            quote_literal(&since.to_string())
        ))?;
        let mut maps = Vec::with_capacity(rows.len());
        for row in &rows {
            let path =
                field(row, 0).ok_or_else(|| Error::Protocol("null ptrack path".into()))?;
            let hex =
                field(row, 1).ok_or_else(|| Error::Protocol("null ptrack pagemap".into()))?;
            maps.push(PtrackPagemap {
                rel_path: path,
                pagemap: decode_hex(&hex)?,
            });
        }
        Ok(maps)
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.strip_prefix("\\x").unwrap_or(hex);
    if hex.len() % 2 != 0 {
        return Err(Error::Protocol("odd-length pagemap encoding".into()).into());
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| Error::Protocol("invalid pagemap encoding".into()))?;
        bytes.push(byte);
    }
    Ok(bytes)
}
