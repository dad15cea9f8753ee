fn main() {
    if let Err(err) = resonans_lib::run() {
        eprintln!("resonans: {err:?}");
        std::process::exit(1);
    }
}
