use std::path::Path;

use anyhow::{bail, Context, Result};

/// Kernel switch for per-entry packet and byte counters.
pub const ACCOUNTING_SYSCTL: &str = "/proc/sys/net/netfilter/nf_conntrack_acct";

/// Turn conntrack accounting on if it is off.
///
/// Returns `true` when the value was switched from `0` to `1`. Entries that
/// already existed at that point carry no counters.
pub fn enable_accounting(path: &Path) -> Result<bool> {
    let current = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    match current.trim() {
        "1" => Ok(false),
        "0" => {
            std::fs::write(path, "1").with_context(|| format!("writing {}", path.display()))?;
            Ok(true)
        }
        other => bail!("unexpected value in {}: {other:?}", path.display()),
    }
}
