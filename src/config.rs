// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use winit::keyboard::KeyCode;

use crate::logging::Verbosity;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub camera: CameraConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Raytracing!".to_string(),
            width: 1366,
            height: 768,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "auto".to_string(),
            max_frames_in_flight: 2,
        }
    }
}

/// Camera placement for the ray generation shader
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub target: [f32; 3],
    pub fov_y_degrees: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.5, 0.5, 1.5],
            target: [0.5, 0.5, 0.0],
            fov_y_degrees: 60.0,
            z_near: 0.01,
            z_far: 100.0,
        }
    }
}

/// Compiled shader locations and pipeline cache
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: String,
    pub raygen: String,
    pub miss: String,
    pub closest_hit: String,
    pub hot_reload: bool,
    pub pipeline_cache: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: "shaders".to_string(),
            raygen: "raygen.rgen.spv".to_string(),
            miss: "miss.rmiss.spv".to_string(),
            closest_hit: "closesthit.rchit.spv".to_string(),
            hot_reload: true,
            pipeline_cache: "pipeline_cache.bin".to_string(),
        }
    }
}

impl ShaderConfig {
    pub fn raygen_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.raygen)
    }

    pub fn miss_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.miss)
    }

    pub fn closest_hit_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.closest_hit)
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub verbosity: Verbosity,
    pub colored_output: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub renderdoc: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            verbosity: Verbosity::default(),
            colored_output: true,
            log_to_file: false,
            log_file: "raytracer.log".to_string(),
            show_fps: true,
            renderdoc: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub capture_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            capture_key: "F12".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

/// Resolved key bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBindings {
    pub fullscreen: KeyCode,
    pub capture: KeyCode,
    pub quit: KeyCode,
}

impl ControlsConfig {
    pub fn bindings(&self) -> KeyBindings {
        KeyBindings {
            fullscreen: resolve_key(&self.fullscreen_key, KeyCode::F11),
            capture: resolve_key(&self.capture_key, KeyCode::F12),
            quit: resolve_key(&self.quit_key, KeyCode::Escape),
        }
    }
}

fn resolve_key(name: &str, fallback: KeyCode) -> KeyCode {
    parse_key_code(name).unwrap_or_else(|| {
        log::warn!("Unknown key '{}', using {:?}", name, fallback);
        fallback
    })
}

/// Parse a key name like "F11", "Escape" or "R" into a winit key code
pub fn parse_key_code(name: &str) -> Option<KeyCode> {
    let key = match name.trim().to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "a" => KeyCode::KeyA,
        "b" => KeyCode::KeyB,
        "c" => KeyCode::KeyC,
        "d" => KeyCode::KeyD,
        "e" => KeyCode::KeyE,
        "f" => KeyCode::KeyF,
        "g" => KeyCode::KeyG,
        "h" => KeyCode::KeyH,
        "i" => KeyCode::KeyI,
        "j" => KeyCode::KeyJ,
        "k" => KeyCode::KeyK,
        "l" => KeyCode::KeyL,
        "m" => KeyCode::KeyM,
        "n" => KeyCode::KeyN,
        "o" => KeyCode::KeyO,
        "p" => KeyCode::KeyP,
        "q" => KeyCode::KeyQ,
        "r" => KeyCode::KeyR,
        "s" => KeyCode::KeyS,
        "t" => KeyCode::KeyT,
        "u" => KeyCode::KeyU,
        "v" => KeyCode::KeyV,
        "w" => KeyCode::KeyW,
        "x" => KeyCode::KeyX,
        "y" => KeyCode::KeyY,
        "z" => KeyCode::KeyZ,
        _ => return None,
    };
    Some(key)
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.sanitize();
        Ok(config)
    }

    fn sanitize(&mut self) {
        if self.graphics.max_frames_in_flight == 0 {
            log::warn!("max_frames_in_flight must be at least 1, using 1");
            self.graphics.max_frames_in_flight = 1;
        }
    }

    /// Preferred present mode, `None` lets the swapchain pick
    pub fn preferred_present_mode(&self) -> Option<ash::vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "auto" => None,
            "immediate" => Some(ash::vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(ash::vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(ash::vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(ash::vk::PresentModeKHR::FIFO_RELAXED),
            _ => {
                log::warn!(
                    "Unknown present mode '{}', choosing automatically",
                    self.graphics.present_mode
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.title, "Raytracing!");
        assert_eq!(config.window.width, 1366);
        assert_eq!(config.window.height, 768);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.shaders.directory, "shaders");
        assert_eq!(config.controls.bindings().quit, KeyCode::Escape);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 800

            [debug]
            verbosity = "trivial"
            colored_output = false
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 768);
        assert_eq!(config.debug.verbosity, Verbosity::Trivial);
        assert!(!config.debug.colored_output);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = Config::parse("[graphics]\nmax_frames_in_flight = 0\n").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 1);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
        assert!(Config::parse("[debug]\nverbosity = \"loud\"\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.graphics.present_mode, "auto");
    }

    #[test]
    fn present_mode_names() {
        let mut config = Config::default();
        assert_eq!(config.preferred_present_mode(), None);

        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.preferred_present_mode(), Some(vk::PresentModeKHR::MAILBOX));

        config.graphics.present_mode = "fifo_relaxed".to_string();
        assert_eq!(config.preferred_present_mode(), Some(vk::PresentModeKHR::FIFO_RELAXED));

        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.preferred_present_mode(), None);
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key_code("F11"), Some(KeyCode::F11));
        assert_eq!(parse_key_code(" esc "), Some(KeyCode::Escape));
        assert_eq!(parse_key_code("r"), Some(KeyCode::KeyR));
        assert_eq!(parse_key_code("Hyper"), None);
    }

    #[test]
    fn unknown_binding_uses_default() {
        let controls = ControlsConfig {
            fullscreen_key: "nonsense".to_string(),
            capture_key: "P".to_string(),
            quit_key: "Q".to_string(),
        };
        let bindings = controls.bindings();
        assert_eq!(bindings.fullscreen, KeyCode::F11);
        assert_eq!(bindings.capture, KeyCode::KeyP);
        assert_eq!(bindings.quit, KeyCode::KeyQ);
    }

    #[test]
    fn shader_paths_join_directory() {
        let shaders = ShaderConfig::default();
        assert_eq!(shaders.raygen_path(), Path::new("shaders").join("raygen.rgen.spv"));
        assert_eq!(shaders.closest_hit_path(), Path::new("shaders").join("closesthit.rchit.spv"));
    }
}
