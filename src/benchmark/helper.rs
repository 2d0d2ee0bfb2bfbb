use std::{fs::File, os::unix::prelude::PermissionsExt, path::Path};

use csv::Writer;

pub fn create_writer(path: &Path) -> Result<Writer<File>, std::io::Error> {
    let f = File::create(path)?;
    let mut permissions = f.metadata()?.permissions();
    permissions.set_mode(0o664);
    f.set_permissions(permissions)?;
    Ok(Writer::from_writer(f))
}

/// Pins the calling thread, wrapping `id` around the available cpus.
pub fn pin_to_cpu(id: usize, num_cpu: usize) -> usize {
    let cpu_id = id % num_cpu.max(1);
    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu_id }) {
        log::debug!("could not pin thread {} to cpu {}", id, cpu_id);
    }
    cpu_id
}
