fn main() {
    if let Err(e) = mocolamma_lib::run() {
        eprintln!("mocolamma: {:#}", e);
        std::process::exit(1);
    }
}
