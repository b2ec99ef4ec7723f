fn main() -> anyhow::Result<()> {
    raportd::run()
}
