fn main() {
    if let Err(e) = specmatrix_lib::run() {
        eprintln!("specmatrix-worker: {e}");
        std::process::exit(1);
    }
}
