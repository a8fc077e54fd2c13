use facelogin_core::detector::DEFAULT_MODEL_FILE;
use facelogin_core::Thresholds;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// SeetaFace frontal face detection model.
    pub model_path: PathBuf,
    /// Directory for audit copies of detected faces; `None` disables them.
    pub crop_dir: Option<PathBuf>,
    /// Duplicate-check and login distance thresholds.
    pub thresholds: Thresholds,
    /// Smallest face side, in pixels, the detector reports.
    pub min_face_size: u32,
    /// Upper bound on one detect + extract round trip.
    pub extract_timeout: Duration,
}

impl Config {
    /// Load configuration from `FACELOGIN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facelogin");

        let db_path = get("FACELOGIN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("identities.db"));

        let model_path = get("FACELOGIN_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DEFAULT_MODEL_FILE));

        // Explicitly empty disables audit crops.
        let crop_dir = match get("FACELOGIN_CROP_DIR") {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(PathBuf::from("uploads/faces")),
        };

        let thresholds = Thresholds {
            registration: parse_or(
                &get,
                "FACELOGIN_REGISTRATION_THRESHOLD",
                Thresholds::DEFAULT_REGISTRATION,
            ),
            login: parse_or(&get, "FACELOGIN_LOGIN_THRESHOLD", Thresholds::DEFAULT_LOGIN),
        };

        Self {
            db_path,
            model_path,
            crop_dir,
            thresholds,
            min_face_size: parse_or(&get, "FACELOGIN_MIN_FACE_SIZE", 30),
            extract_timeout: Duration::from_secs(parse_or(
                &get,
                "FACELOGIN_EXTRACT_TIMEOUT_SECS",
                10,
            )),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
