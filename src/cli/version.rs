/// Display version information
pub fn execute() {
    println!("trustseed {}", env!("CARGO_PKG_VERSION"));
    println!("Cluster transport trust bootstrap");
}
