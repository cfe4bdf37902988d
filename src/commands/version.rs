pub fn run() -> anyhow::Result<()> {
    println!("talzner {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
