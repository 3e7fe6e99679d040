pub fn run() -> anyhow::Result<()> {
    println!("activity-engine {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
