use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{GpuBackend, TargetDesc, TargetId};
use crate::error::RenderError;
use crate::pixels::PixelImage;
use crate::types::{BufferConfig, BufferKey, DisplayResolution};

/// A pooled render target sized for one display resolution.
///
/// Handles are shared between every node that requested the same config. When
/// the pool is resized the handle is invalidated and replaced; the key keeps
/// resolving to the replacement.
#[derive(Debug)]
pub struct BufferHandle {
    config: BufferConfig,
    width: u32,
    height: u32,
    target: TargetId,
    valid: AtomicBool,
}

impl BufferHandle {
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn key(&self) -> &BufferKey {
        &self.config.key
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn is_multisampled(&self) -> bool {
        self.config.is_multisampled()
    }

    /// False once the pool has replaced or released this handle.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

struct PoolEntry {
    handle: Arc<BufferHandle>,
    users: usize,
}

/// Render targets keyed by logical name and sized relative to the display.
pub struct BufferPool {
    backend: Box<dyn GpuBackend>,
    resolution: DisplayResolution,
    entries: BTreeMap<BufferKey, PoolEntry>,
}

impl BufferPool {
    pub fn new(backend: Box<dyn GpuBackend>, resolution: DisplayResolution) -> Self {
        Self {
            backend,
            resolution,
            entries: BTreeMap::new(),
        }
    }

    pub fn resolution(&self) -> DisplayResolution {
        self.resolution
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GpuBackend {
        self.backend.as_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BufferKey> {
        self.entries.keys()
    }

    /// Returns the handle for `config`, allocating it on first request.
    ///
    /// Repeated requests with an identical config return the same handle and
    /// bump its usage count. A different config under an existing key, or a
    /// format the backend cannot store, is a configuration error.
    pub fn get_or_create(&mut self, config: &BufferConfig) -> Result<Arc<BufferHandle>, RenderError> {
        if let Some(entry) = self.entries.get_mut(&config.key) {
            if entry.handle.config != *config {
                return Err(RenderError::ConflictingConfig {
                    key: config.key.clone(),
                });
            }
            entry.users += 1;
            return Ok(Arc::clone(&entry.handle));
        }

        if config.samples == 0 || !self.backend.supports(config.format, config.samples) {
            return Err(RenderError::UnsupportedFormat {
                key: config.key.clone(),
                format: config.format,
                samples: config.samples,
                backend: self.backend.name(),
            });
        }

        let handle = Arc::new(allocate(self.backend.as_mut(), config, self.resolution)?);
        tracing::debug!(
            key = %config.key,
            width = handle.width,
            height = handle.height,
            format = %config.format,
            "allocated buffer"
        );
        self.entries.insert(
            config.key.clone(),
            PoolEntry {
                handle: Arc::clone(&handle),
                users: 1,
            },
        );
        Ok(handle)
    }

    pub fn handle(&self, key: &BufferKey) -> Option<Arc<BufferHandle>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.handle))
    }

    pub fn users(&self, key: &BufferKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.users)
    }

    pub fn target(&self, key: &BufferKey) -> Result<TargetId, RenderError> {
        self.entries
            .get(key)
            .map(|entry| entry.handle.target)
            .ok_or_else(|| RenderError::UnknownBuffer(key.clone()))
    }

    /// Drops one use of `key`, freeing the target after the last one.
    /// Returns true when the buffer was freed.
    pub fn release(&mut self, key: &BufferKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users > 0 {
            return false;
        }

        if let Some(entry) = self.entries.remove(key) {
            entry.handle.invalidate();
            self.backend.release(entry.handle.target);
            tracing::debug!(%key, "released buffer");
        }
        true
    }

    /// Recreates every buffer for `resolution`.
    ///
    /// All replacements are allocated before the old targets are freed; if any
    /// allocation fails the pool is left untouched and the error is returned.
    /// Returns `Ok(false)` when the resolution is unchanged.
    pub fn resize(&mut self, resolution: DisplayResolution) -> Result<bool, RenderError> {
        if resolution == self.resolution {
            return Ok(false);
        }

        let mut replacements: Vec<(BufferKey, BufferHandle)> = Vec::with_capacity(self.entries.len());
        for (key, entry) in &self.entries {
            match allocate(self.backend.as_mut(), &entry.handle.config, resolution) {
                Ok(handle) => replacements.push((key.clone(), handle)),
                Err(error) => {
                    for (_, handle) in replacements {
                        self.backend.release(handle.target);
                    }
                    return Err(error);
                }
            }
        }

        for (key, handle) in replacements {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.handle.invalidate();
                self.backend.release(entry.handle.target);
                entry.handle = Arc::new(handle);
            }
        }

        tracing::debug!(
            from = %self.resolution,
            to = %resolution,
            buffers = self.entries.len(),
            "resized buffer pool"
        );
        self.resolution = resolution;
        Ok(true)
    }

    pub fn read(&mut self, key: &BufferKey) -> Result<PixelImage, RenderError> {
        let target = self.target(key)?;
        Ok(self.backend.read_back(target)?)
    }

    pub fn write_count(&self, key: &BufferKey) -> u64 {
        self.entries
            .get(key)
            .map_or(0, |entry| self.backend.write_count(entry.handle.target))
    }

    /// Frees every buffer regardless of usage counts.
    pub fn clear(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            entry.handle.invalidate();
            self.backend.release(entry.handle.target);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.clear();
    }
}

fn allocate(
    backend: &mut dyn GpuBackend,
    config: &BufferConfig,
    resolution: DisplayResolution,
) -> Result<BufferHandle, RenderError> {
    let (width, height) = resolution.scaled(config.scale);
    let desc = TargetDesc {
        label: config.key.to_string(),
        width,
        height,
        format: config.format,
        samples: config.samples,
    };
    let target = backend
        .allocate(&desc)
        .map_err(|source| RenderError::Allocation {
            key: config.key.clone(),
            source,
        })?;
    Ok(BufferHandle {
        config: config.clone(),
        width,
        height,
        target,
        valid: AtomicBool::new(true),
    })
}
