fn main() -> anyhow::Result<()> {
    agency_tracker_lib::run()
}
