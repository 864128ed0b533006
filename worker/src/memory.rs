use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::{TaskError, WorkerError};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Dueño de una reserva (páginas de memoria y archivos temporales).
/// Cada `RuntimeEnvironment` tiene el suyo, así un despliegue duplicado
/// nunca libera recursos ajenos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(u64);

impl AllocationId {
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// Una página de memoria de tamaño fijo.
#[derive(Debug)]
pub struct MemorySegment {
    buf: Vec<u8>,
}

impl MemorySegment {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

struct Pool {
    free: usize,
    owners: HashMap<AllocationId, usize>,
}

/// Pool de capacidad fija de páginas iguales.
pub struct MemoryManager {
    page_size: usize,
    total_pages: usize,
    pool: Mutex<Pool>,
}

impl MemoryManager {
    pub fn new(usable_bytes: u64, page_size: usize) -> Result<Self, WorkerError> {
        if page_size == 0 {
            return Err(WorkerError::Config("page_size no puede ser 0".into()));
        }

        let total_pages = (usable_bytes / page_size as u64) as usize;
        if total_pages == 0 {
            return Err(WorkerError::Memory(format!(
                "{} bytes no alcanzan para una página de {} bytes",
                usable_bytes, page_size
            )));
        }

        info!(
            "memory manager: {} páginas de {} KiB ({} MiB)",
            total_pages,
            page_size / 1024,
            usable_bytes >> 20
        );

        Ok(Self {
            page_size,
            total_pages,
            pool: Mutex::new(Pool {
                free: total_pages,
                owners: HashMap::new(),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_pages(&self) -> usize {
        self.pool.lock().free
    }

    pub fn owned_pages(&self, owner: AllocationId) -> usize {
        self.pool.lock().owners.get(&owner).copied().unwrap_or(0)
    }

    /// Reserva `pages` páginas para `owner`. Todo o nada.
    pub fn allocate(
        &self,
        owner: AllocationId,
        pages: usize,
    ) -> Result<Vec<MemorySegment>, TaskError> {
        if pages == 0 {
            return Ok(Vec::new());
        }

        {
            let mut pool = self.pool.lock();
            if pool.free < pages {
                return Err(TaskError::InsufficientResources(format!(
                    "se pidieron {} páginas y quedan {} libres",
                    pages, pool.free
                )));
            }
            pool.free -= pages;
            *pool.owners.entry(owner).or_insert(0) += pages;
        }

        debug!("{}: reservadas {} páginas", owner, pages);
        Ok((0..pages)
            .map(|_| MemorySegment {
                buf: vec![0u8; self.page_size],
            })
            .collect())
    }

    /// Devuelve todas las páginas de `owner`. Una segunda llamada no hace
    /// nada y devuelve 0.
    pub fn release(&self, owner: AllocationId) -> usize {
        let mut pool = self.pool.lock();
        match pool.owners.remove(&owner) {
            Some(pages) => {
                pool.free += pages;
                debug!("{}: liberadas {} páginas", owner, pages);
                pages
            }
            None => 0,
        }
    }

    /// Recupera todo; lo que siga reservado se reporta como pérdida.
    pub fn shutdown(&self) {
        let mut pool = self.pool.lock();
        for (owner, pages) in pool.owners.drain() {
            warn!("{} no liberó {} páginas antes del apagado", owner, pages);
        }
        pool.free = self.total_pages;
    }
}
