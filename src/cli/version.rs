/// Display version information
pub fn execute() {
    println!("psigrid {}", env!("CARGO_PKG_VERSION"));
    println!("PSI handshake orchestration service");
}
