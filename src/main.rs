fn main() -> anyhow::Result<()> {
    ck_cli::run()
}
