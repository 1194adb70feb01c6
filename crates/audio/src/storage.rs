//! Stockage temporaire sur disque
//! 
//! Pont entre le pipeline de lecture et le périphérique de sortie : chaque
//! entrée matérialisée est écrite dans un fichier au nom unique, puis
//! supprimée après la lecture.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::{AudioError, AudioResult, ScratchHandle, ScratchStorage};

/// Stockage temporaire dans un répertoire du système de fichiers
#[derive(Clone, Debug)]
pub struct FsScratchStorage {
    root: PathBuf,
}

impl FsScratchStorage {
    /// Crée un stockage dans `root` (créé s'il n'existe pas)
    /// 
    /// # Erreurs
    /// - `AudioError::Io` si le répertoire ne peut pas être créé
    pub fn new(root: impl Into<PathBuf>) -> AudioResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
    
    /// Stockage dans `<temp>/parlo`
    pub fn in_temp_dir() -> AudioResult<Self> {
        Self::new(std::env::temp_dir().join("parlo"))
    }
    
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScratchStorage for FsScratchStorage {
    fn write(&self, bytes: &[u8]) -> AudioResult<ScratchHandle> {
        let path = self.root.join(format!("{}.wav", Uuid::new_v4()));
        fs::write(&path, bytes)
            .map_err(|e| AudioError::Scratch(format!("écriture de {} : {}", path.display(), e)))?;
        
        debug!("💾 Ressource écrite : {} ({} octets)", path.display(), bytes.len());
        Ok(ScratchHandle { path })
    }
    
    fn delete(&self, handle: &ScratchHandle) -> AudioResult<()> {
        fs::remove_file(&handle.path).map_err(|e| {
            AudioError::Scratch(format!("suppression de {} : {}", handle.path.display(), e))
        })?;
        
        debug!("🧹 Ressource supprimée : {}", handle.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn test_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("parlo-test-{}-{}", name, Uuid::new_v4()))
    }
    
    #[test]
    fn test_write_generates_unique_paths() {
        let storage = FsScratchStorage::new(test_root("unique")).unwrap();
        
        let first = storage.write(b"RIFF").unwrap();
        let second = storage.write(b"RIFF").unwrap();
        
        assert_ne!(first.path, second.path);
        assert!(first.path.starts_with(storage.root()));
        assert_eq!(fs::read(&first.path).unwrap(), b"RIFF");
        
        let _ = fs::remove_dir_all(storage.root());
    }
    
    #[test]
    fn test_delete_removes_file() {
        let storage = FsScratchStorage::new(test_root("delete")).unwrap();
        let handle = storage.write(&[0u8; 16]).unwrap();
        
        storage.delete(&handle).unwrap();
        assert!(!handle.path.exists());
        assert!(matches!(storage.delete(&handle), Err(AudioError::Scratch(_))));
        
        let _ = fs::remove_dir_all(storage.root());
    }
}
