fn main() {
    let args = std::env::args();
    if let Err(err) = pgcatchup::run(args) {
        eprintln!("pgcatchup error: {err}");
        std::process::exit(1);
    }
}
