mod entry;

use fleetbench::error::AppResult;

fn main() -> AppResult<()> {
    entry::run()
}
