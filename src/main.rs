fn main() -> anyhow::Result<()> {
    swing_capture_lib::run()
}
