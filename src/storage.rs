use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    domain::{ItemId, SnoozePreset},
    query::SortField,
};

const STORAGE_DIR_NAME: &str = ".trailer";
const SETTINGS_FILE: &str = "settings.json";
const UI_STATE_FILE: &str = "ui_state.json";
const OVERVIEW_FILE: &str = "overview.json";
const ITEMS_CACHE_FILE: &str = "items.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub show_comments_everywhere: bool,
    pub separate_api_servers: bool,
    pub dont_ask_before_wiping_merged: bool,
    pub dont_ask_before_wiping_closed: bool,
    pub open_items_directly_in_browser: bool,
    pub hide_uncommented_items: bool,
    pub prefer_issues_in_watch: bool,
    pub show_labels: bool,
    pub show_status_items: bool,
    pub sort: SortField,
    pub sort_descending: bool,
    pub snooze_presets: Vec<SnoozePreset>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_comments_everywhere: false,
            separate_api_servers: false,
            dont_ask_before_wiping_merged: false,
            dont_ask_before_wiping_closed: false,
            open_items_directly_in_browser: false,
            hide_uncommented_items: false,
            prefer_issues_in_watch: false,
            show_labels: false,
            show_status_items: false,
            sort: SortField::Updated,
            sort_descending: true,
            snooze_presets: Vec::new(),
        }
    }
}

/// What the window was showing when the app last ran.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiState {
    pub last_tab_index: usize,
    pub filter_text: String,
    pub selected: Option<ItemId>,
    pub scroll_anchor: Option<ItemId>,
}

/// Layout of `~/.trailer`.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn initialize() -> Result<Self, StorageError> {
        let home = dirs::home_dir().ok_or(StorageError::HomeDirMissing)?;
        Self::at(home.join(STORAGE_DIR_NAME))
    }

    pub fn at(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overview_path(&self) -> PathBuf {
        self.root.join(OVERVIEW_FILE)
    }

    pub fn items_cache_path(&self) -> PathBuf {
        self.root.join(ITEMS_CACHE_FILE)
    }

    pub fn load_settings(&self) -> Result<Settings, StorageError> {
        read_json(&self.root.join(SETTINGS_FILE))
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        write_json(&self.root.join(SETTINGS_FILE), settings)
    }

    pub fn load_ui_state(&self) -> Result<UiState, StorageError> {
        read_json(&self.root.join(UI_STATE_FILE))
    }

    pub fn save_ui_state(&self, state: &UiState) -> Result<(), StorageError> {
        write_json(&self.root.join(UI_STATE_FILE), state)
    }
}

/// A missing file reads as the default value.
pub fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("home directory not found; cannot store data under ~/.trailer")]
    HomeDirMissing,
    #[error("I/O error while handling stored data: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize stored data: {0}")]
    Serialization(#[from] serde_json::Error),
}
