fn main() -> anyhow::Result<()> {
    pulsefit_lib::run()
}
