//! Configuration and color scheme management for pipeterm.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.pipeterm/config.toml`
//! - Built-in color schemes for the console's color classes
//! - Per-class color overrides
//!
//! # Configuration File
//!
//! ```toml
//! # Process to run (default: cmd.exe on Windows, $SHELL elsewhere)
//! command = "git"
//! args = "status"
//! working_dir = "C:\\src\\project"
//!
//! # Start the command again whenever it exits on its own
//! auto_restart = true
//!
//! # Write start/exit notices into the console
//! show_diagnostics = false
//!
//! # Color scheme: default, solarized-dark, monokai
//! color_scheme = "default"
//!
//! [colors]
//! error = { r = 255, g = 80, b = 80 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{ColorClass, LaunchSpec};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command to run, `None` for the platform shell
    pub command: Option<String>,
    /// Argument string passed to the command
    pub args: Option<String>,
    /// Working directory of the command
    pub working_dir: Option<PathBuf>,
    /// Restart the command when it exits on its own
    pub auto_restart: bool,
    /// Show start/exit notices
    pub show_diagnostics: bool,
    /// Color scheme name
    pub color_scheme: String,
    /// Per-class color overrides
    pub colors: ColorOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            working_dir: None,
            auto_restart: true,
            show_diagnostics: false,
            color_scheme: "default".to_string(),
            colors: ColorOverrides::default(),
        }
    }
}

/// Colors replacing the scheme's for single classes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorOverrides {
    pub output: Option<Color>,
    pub error: Option<Color>,
    pub input: Option<Color>,
    pub diagnostic: Option<Color>,
    pub command: Option<Color>,
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load a configuration file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                match Self::from_toml(&content) {
                    Ok(config) => return config,
                    Err(e) => warn!("Ignoring {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to `~/.pipeterm/config.toml`, returning the path
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::get_config_path().context("Could not determine config path")?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Process to start, with the platform shell as fallback
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut launch = LaunchSpec::new(
            self.command
                .clone()
                .filter(|command| !command.trim().is_empty())
                .unwrap_or_else(default_shell),
        );
        if let Some(args) = &self.args {
            launch = launch.with_args(args.clone());
        }
        if let Some(dir) = &self.working_dir {
            launch = launch.in_dir(dir.clone());
        }
        launch
    }

    /// Get the color scheme with overrides applied
    pub fn get_color_scheme(&self) -> ColorScheme {
        let mut scheme = ColorScheme::by_name(&self.color_scheme);
        let overrides = &self.colors;
        if let Some(color) = overrides.output {
            scheme.output = color;
        }
        if let Some(color) = overrides.error {
            scheme.error = color;
        }
        if let Some(color) = overrides.input {
            scheme.input = color;
        }
        if let Some(color) = overrides.diagnostic {
            scheme.diagnostic = color;
        }
        if let Some(color) = overrides.command {
            scheme.command = color;
        }
        scheme
    }
}

/// Color definition (RGB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

/// Color scheme definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorScheme {
    pub name: String,

    // Text colors per class
    pub output: Color,
    pub error: Color,
    pub input: Color,
    pub diagnostic: Color,
    pub command: Color,

    pub background: Color,

    // Status bar colors
    pub status_bar_bg: Color,
    pub status_bar_fg: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self::default_scheme()
    }
}

impl ColorScheme {
    /// Default color scheme
    pub fn default_scheme() -> Self {
        Self {
            name: "default".to_string(),

            output: Color::new(211, 211, 211),
            error: Color::new(255, 0, 0),
            input: Color::new(224, 234, 9),
            diagnostic: Color::new(0, 255, 0),
            command: Color::new(0, 255, 255),

            background: Color::new(0, 0, 0),

            status_bar_bg: Color::new(0, 100, 0),
            status_bar_fg: Color::new(255, 255, 255),
        }
    }

    /// Solarized Dark scheme
    pub fn solarized_dark() -> Self {
        Self {
            name: "solarized-dark".to_string(),

            output: Color::new(147, 161, 161),
            error: Color::new(220, 50, 47),
            input: Color::new(181, 137, 0),
            diagnostic: Color::new(133, 153, 0),
            command: Color::new(42, 161, 152),

            background: Color::new(0, 43, 54),

            status_bar_bg: Color::new(7, 54, 66),
            status_bar_fg: Color::new(147, 161, 161),
        }
    }

    /// Monokai scheme
    pub fn monokai() -> Self {
        Self {
            name: "monokai".to_string(),

            output: Color::new(248, 248, 242),
            error: Color::new(249, 38, 114),
            input: Color::new(230, 219, 116),
            diagnostic: Color::new(166, 226, 46),
            command: Color::new(102, 217, 239),

            background: Color::new(39, 40, 34),

            status_bar_bg: Color::new(60, 60, 54),
            status_bar_fg: Color::new(248, 248, 242),
        }
    }

    /// Get scheme by name
    pub fn by_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "solarized-dark" | "solarized_dark" => Self::solarized_dark(),
            "monokai" => Self::monokai(),
            _ => Self::default_scheme(),
        }
    }

    /// List available schemes
    pub fn list() -> Vec<&'static str> {
        vec!["default", "solarized-dark", "monokai"]
    }

    /// Text color of a class
    pub fn color_for(&self, class: ColorClass) -> Color {
        match class {
            ColorClass::Output => self.output,
            ColorClass::Error => self.error,
            ColorClass::Input => self.input,
            ColorClass::Diagnostic => self.diagnostic,
            ColorClass::Command => self.command,
        }
    }
}

/// Shell started when no command is configured
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        "cmd.exe".to_string()
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// `~/.pipeterm`, created on first use
pub fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".pipeterm");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
