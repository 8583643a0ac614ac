use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInputs {
    pub home_dir: PathBuf,
    pub xdg_config_home: Option<PathBuf>,
    pub margin_dir_override: Option<PathBuf>,
    pub config_file_override: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarginPaths {
    pub margin_dir: PathBuf,

    pub state_file: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,

    pub config_dir: PathBuf,
    pub config_file: PathBuf,
}

pub fn compute_paths(inputs: PathInputs) -> MarginPaths {
    let margin_dir = inputs
        .margin_dir_override
        .clone()
        .unwrap_or_else(|| inputs.home_dir.join(".margin"));

    let config_dir = match inputs.margin_dir_override {
        Some(ref override_dir) => override_dir.join("config"),
        None => inputs
            .xdg_config_home
            .unwrap_or_else(|| inputs.home_dir.join(".config"))
            .join("margin"),
    };

    let config_file = inputs
        .config_file_override
        .unwrap_or_else(|| config_dir.join("config.toml"));

    MarginPaths {
        state_file: margin_dir.join("state.json"),
        lock_path: margin_dir.join("margin.lock"),
        log_path: margin_dir.join("margin.log"),

        margin_dir,
        config_dir,
        config_file,
    }
}
