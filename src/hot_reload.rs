// Shader hot-reload
//
// Watches the compiled shader directory. When a .spv file is written, the
// renderer rebuilds its ray tracing pipeline and shader binding table.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    pending: Arc<Mutex<Vec<PathBuf>>>,
}

impl ShaderWatcher {
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref();
        let pending = Arc::new(Mutex::new(Vec::new()));

        let sink = pending.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => queue_event(&event, &sink),
            Err(e) => log::warn!("Shader watcher error: {}", e),
        })
        .context("Failed to create shader watcher")?;

        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch shader directory: {:?}", directory))?;

        log::info!("Watching {:?} for shader changes", directory);

        Ok(Self {
            _watcher: watcher,
            pending,
        })
    }

    /// Drain the shader files changed since the last call
    pub fn take_changes(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.pending.lock())
    }
}

fn is_shader_binary(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "spv")
}

fn queue_event(event: &Event, pending: &Mutex<Vec<PathBuf>>) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    let mut pending = pending.lock();
    for path in event.paths.iter().filter(|p| is_shader_binary(p)) {
        if !pending.contains(path) {
            log::debug!("Shader changed: {:?}", path);
            pending.push(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    #[test]
    fn only_spirv_files_count() {
        assert!(is_shader_binary(Path::new("shaders/raygen.rgen.spv")));
        assert!(!is_shader_binary(Path::new("shaders/raygen.rgen")));
        assert!(!is_shader_binary(Path::new("shaders")));
    }

    #[test]
    fn writes_are_queued_once() {
        let pending = Mutex::new(Vec::new());
        let spv = PathBuf::from("shaders/miss.rmiss.spv");

        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(spv.clone())
            .add_path(PathBuf::from("shaders/miss.rmiss"));
        queue_event(&modify, &pending);
        queue_event(&modify, &pending);

        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("shaders/raygen.rgen.spv"));
        queue_event(&create, &pending);

        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("shaders/closesthit.rchit.spv"));
        queue_event(&remove, &pending);

        assert_eq!(
            *pending.lock(),
            vec![spv, PathBuf::from("shaders/raygen.rgen.spv")]
        );
    }
}
