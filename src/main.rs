fn main() -> anyhow::Result<()> {
    corouter::cli::run_cli()
}
