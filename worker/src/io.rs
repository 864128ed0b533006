use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::memory::AllocationId;

/// Verifica que cada ruta exista, sea un directorio y se pueda escribir.
/// Los errores nombran el directorio por su posición (desde 1).
pub fn check_tmp_dirs(dirs: &[PathBuf]) -> Result<(), WorkerError> {
    if dirs.is_empty() {
        return Err(WorkerError::Config(
            "no hay directorios temporales configurados".into(),
        ));
    }

    for (i, dir) in dirs.iter().enumerate() {
        let index = i + 1;
        let fail = |reason: &str| WorkerError::ScratchDir {
            index,
            reason: reason.to_string(),
        };

        if !dir.exists() {
            return Err(fail("no existe"));
        }
        if !dir.is_dir() {
            return Err(fail("no es un directorio"));
        }
        if !is_writable(dir) {
            return Err(fail("no tiene permisos de escritura"));
        }
    }
    Ok(())
}

fn is_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".worker-probe-{}-{}", process::id(), uuid::Uuid::new_v4()));
    match File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Entrega archivos temporales repartidos round-robin entre los
/// directorios y los borra cuando el dueño los libera.
pub struct IoManager {
    dirs: Vec<PathBuf>,
    cursor: AtomicUsize,
    seq: AtomicUsize,
    files: Mutex<HashMap<AllocationId, Vec<PathBuf>>>,
}

impl IoManager {
    pub fn new(dirs: Vec<PathBuf>) -> Result<Self, WorkerError> {
        check_tmp_dirs(&dirs)?;
        info!("io manager con {} directorio(s) temporal(es)", dirs.len());
        Ok(Self {
            dirs,
            cursor: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Crea un archivo temporal vacío para `owner` y devuelve su ruta.
    pub fn create_scratch_file(
        &self,
        owner: AllocationId,
        prefix: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = &self.dirs[self.cursor.fetch_add(1, Ordering::Relaxed) % self.dirs.len()];
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}-{}-{}-{}.tmp", prefix, process::id(), owner, n));

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        self.files.lock().entry(owner).or_default().push(path.clone());
        Ok(path)
    }

    pub fn owned_files(&self, owner: AllocationId) -> usize {
        self.files.lock().get(&owner).map(Vec::len).unwrap_or(0)
    }

    /// Borra los archivos de `owner`. Idempotente.
    pub fn release(&self, owner: AllocationId) -> usize {
        let files = self.files.lock().remove(&owner).unwrap_or_default();
        let n = files.len();
        for f in files {
            remove_quietly(&f);
        }
        if n > 0 {
            debug!("{}: borrados {} archivos temporales", owner, n);
        }
        n
    }

    pub fn shutdown(&self) {
        let all: Vec<_> = self.files.lock().drain().collect();
        for (owner, files) in all {
            warn!("{} dejó {} archivos temporales; se borran", owner, files.len());
            for f in files {
                remove_quietly(&f);
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("no se pudo borrar {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn tmp(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("worker-io-{}-{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_dir_is_reported_with_its_position() {
        let ok = tmp("ok");
        let missing = ok.join("nope");
        match check_tmp_dirs(&[ok.clone(), missing]) {
            Err(WorkerError::ScratchDir { index, reason }) => {
                assert_eq!(index, 2);
                assert!(reason.contains("no existe"));
            }
            other => panic!("esperaba ScratchDir, vino {:?}", other),
        }
        fs::remove_dir_all(ok).ok();
    }

    #[test]
    fn file_instead_of_dir_is_rejected() {
        let dir = tmp("file");
        let file = dir.join("plain.txt");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            check_tmp_dirs(&[file]),
            Err(WorkerError::ScratchDir { index: 1, .. })
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn scratch_files_rotate_and_are_deleted_on_release() {
        let a = tmp("a");
        let b = tmp("b");
        let io = IoManager::new(vec![a.clone(), b.clone()]).unwrap();
        let owner = AllocationId::new();

        let f1 = io.create_scratch_file(owner, "spill").unwrap();
        let f2 = io.create_scratch_file(owner, "spill").unwrap();
        assert_ne!(f1.parent(), f2.parent());
        assert!(f1.exists() && f2.exists());
        assert_eq!(io.owned_files(owner), 2);

        assert_eq!(io.release(owner), 2);
        assert_eq!(io.release(owner), 0);
        assert!(!f1.exists() && !f2.exists());

        fs::remove_dir_all(a).ok();
        fs::remove_dir_all(b).ok();
    }

    #[test]
    fn shutdown_removes_leftovers() {
        let dir = tmp("shutdown");
        let io = IoManager::new(vec![dir.clone()]).unwrap();
        let f = io.create_scratch_file(AllocationId::new(), "x").unwrap();
        io.shutdown();
        assert!(!f.exists());
        fs::remove_dir_all(dir).ok();
    }
}
