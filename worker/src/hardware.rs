use common::HardwareDescription;
use sysinfo::{System, SystemExt};
use tracing::{info, warn};

use crate::error::WorkerError;

/// Fracción de la memoria disponible que se entrega a los administradores.
pub const USABLE_MEMORY_FRACTION: f64 = 0.7;

/// Lee CPU y memoria una sola vez (sysinfo devuelve bytes).
pub fn probe(workers_per_process: usize) -> HardwareDescription {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let cpu_cores = sys.cpus().len().max(1);
    let physical_memory = sys.total_memory();
    let available = sys.available_memory();

    let share = workers_per_process.max(1) as f64;
    let usable_memory = (available as f64 * USABLE_MEMORY_FRACTION / share) as u64;

    HardwareDescription {
        cpu_cores,
        physical_memory,
        usable_memory,
    }
}

/// Aplica el tamaño configurado (MiB). Pedir más que la memoria física
/// es un error fatal.
pub fn apply_memory_override(
    hardware: HardwareDescription,
    memory_size_mb: Option<u64>,
) -> Result<HardwareDescription, WorkerError> {
    let Some(mb) = memory_size_mb.filter(|mb| *mb > 0) else {
        return Ok(hardware);
    };

    let bytes = mb.saturating_mul(1024 * 1024);
    if hardware.physical_memory > 0 && bytes > hardware.physical_memory {
        return Err(WorkerError::Memory(format!(
            "se configuraron {} MiB pero la máquina tiene {} MiB",
            mb,
            hardware.physical_memory >> 20
        )));
    }
    if hardware.physical_memory == 0 {
        warn!("no se pudo leer la memoria física; se usa el valor configurado sin validar");
    }

    info!("memoria configurada explícitamente: {} MiB", mb);
    Ok(HardwareDescription {
        usable_memory: bytes,
        ..hardware
    })
}
