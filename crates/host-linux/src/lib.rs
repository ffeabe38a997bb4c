pub mod device;
pub mod discovery;
pub mod diskstats;
pub mod iostat;
pub mod modules;
pub mod os;
pub mod partition;
pub mod plugins;
pub mod sysfs;

pub use device::{Device, Filesystem};
pub use diskstats::IoStats;
pub use iostat::{IoStat, IoStatExtended};
pub use modules::{ModuleArgs, RemoveMethod};
pub use partition::{Partition, PartitionCheck, PartitionTable, PartitionType};

use dutkit_core::{DiscoveryConfig, DiskInventory, Result, Session};
use tracing::info;

/// Discovers the usable disks on the DUT and wraps them with host details.
pub fn build_inventory(session: &Session, config: &DiscoveryConfig) -> Result<DiskInventory> {
    let host = os::host_info(session)?;
    let disks = discovery::find_disks(session, config)?;
    let inventory = DiskInventory::new(host, disks);
    info!(
        inventory = %inventory.inventory_id,
        disks = inventory.disks.len(),
        "inventory built"
    );
    Ok(inventory)
}
