//! Model Inventory - GGUF files in the models directory

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::gguf;
use super::types::LocalModel;
use crate::llm_engine::provider::LlmError;

static QUANT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[-_.])((?:I?Q[1-8](?:_[0-9A-Z]+)*)|BF16|F16|F32)(?:$|[-_.])")
        .expect("quantization pattern is valid")
});

/// Extension of finished model files
pub const MODEL_EXTENSION: &str = "gguf";

/// Resolves a context size for a freshly scanned model
pub type ContextSizeResolver<'a> = &'a (dyn Fn(&LocalModel) -> Option<u32> + Send + Sync);

/// File-system accessor for downloaded models
pub struct ModelInventory {
    models_dir: PathBuf,
}

impl ModelInventory {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Create the models directory if needed
    pub fn ensure_dir(&self) -> Result<(), LlmError> {
        std::fs::create_dir_all(&self.models_dir).map_err(|e| {
            LlmError::IoFailure(format!(
                "Failed to create models directory {}: {}",
                self.models_dir.display(),
                e
            ))
        })
    }

    /// Scan the models directory, sorted by filename.
    ///
    /// A missing root is an error; an unreadable one yields no models.
    pub fn list_local_models(&self, resolver: ContextSizeResolver<'_>) -> Result<Vec<LocalModel>, LlmError> {
        if !self.models_dir.exists() {
            return Err(LlmError::NotFound(format!(
                "Models directory {} does not exist",
                self.models_dir.display()
            )));
        }
        if !self.models_dir.is_dir() {
            return Err(LlmError::InvalidRequest(format!(
                "Models path {} is not a directory",
                self.models_dir.display()
            )));
        }

        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to read models directory {}: {}", self.models_dir.display(), e);
                return Ok(Vec::new());
            }
        };

        let mut models = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_model_file(&path) {
                continue;
            }
            let mut model = describe(&path);
            model.safe_context_size = resolver(&model);
            models.push(model);
        }

        models.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(models)
    }

    /// Find a local model by id or filename.
    ///
    /// Matches names only; the GGUF header is read for the hit alone. An exact
    /// match wins over a case-insensitive one.
    pub fn find_model(&self, id_or_name: &str) -> Result<LocalModel, LlmError> {
        let not_found = || LlmError::NotFound(format!("Model '{}' is not downloaded", id_or_name));
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Cannot read {}: {}", self.models_dir.display(), e);
                return Err(not_found());
            }
        };

        let wanted = id_or_name.to_lowercase();
        let mut folded = None;
        for path in entries.flatten().map(|e| e.path()) {
            if !is_model_file(&path) {
                continue;
            }
            let (Some(name), Some(stem)) = (path.file_name(), path.file_stem()) else {
                continue;
            };
            let (name, stem) = (name.to_string_lossy(), stem.to_string_lossy());
            if name == id_or_name || stem == id_or_name {
                return Ok(describe(&path));
            }
            if folded.is_none() && (name.to_lowercase() == wanted || stem.to_lowercase() == wanted) {
                folded = Some(path);
            }
        }

        folded.map(|path| describe(&path)).ok_or_else(not_found)
    }

    /// Path for a filename inside the models directory.
    ///
    /// Rejects anything that would escape the directory.
    pub fn resolve_path(&self, filename: &str) -> Result<PathBuf, LlmError> {
        let candidate = Path::new(filename);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.models_dir.join(name)),
            _ => Err(LlmError::InvalidRequest(format!("Invalid model filename '{}'", filename))),
        }
    }

    /// Delete a model file; deleting a missing file succeeds
    pub fn delete_file(&self, path: &Path) -> Result<(), LlmError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                log::info!("Deleted model file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LlmError::IoFailure(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn is_model_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION))
            .unwrap_or(false)
}

/// Build a record for one file; metadata problems leave the optional fields empty
fn describe(path: &Path) -> LocalModel {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let metadata = match gguf::read_metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::debug!("No GGUF metadata for {}: {}", filename, e);
            None
        }
    };

    let quantization = metadata
        .as_ref()
        .and_then(|m| m.quantization())
        .or_else(|| quantization_from_filename(&filename));

    LocalModel {
        display_name: display_name(&id, quantization.as_deref()),
        trained_context_length: metadata.as_ref().and_then(|m| m.context_length),
        block_count: metadata.as_ref().and_then(|m| m.block_count),
        kv_bytes_per_token: metadata.as_ref().and_then(|m| m.kv_bytes_per_token()),
        safe_context_size: None,
        id,
        filename,
        path: path.to_path_buf(),
        size_bytes,
        quantization,
    }
}

/// Quantization label embedded in a filename, upper-cased
pub fn quantization_from_filename(filename: &str) -> Option<String> {
    let stem = filename
        .strip_suffix(".gguf")
        .or_else(|| filename.strip_suffix(".GGUF"))
        .unwrap_or(filename);
    QUANT_PATTERN
        .captures_iter(stem)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

/// "Llama-3.2-3B-Instruct-Q4_K_M" -> "Llama 3.2 3B Instruct"
fn display_name(id: &str, quantization: Option<&str>) -> String {
    let mut base = id.to_string();
    if let Some(q) = quantization {
        let lower = base.to_lowercase();
        if let Some(pos) = lower.rfind(&q.to_lowercase()) {
            if pos > 0 {
                base.truncate(pos);
            }
        }
    }
    let name = base
        .trim_end_matches(|c: char| c == '-' || c == '_' || c == '.')
        .replace(['-', '_'], " ");
    if name.trim().is_empty() {
        id.to_string()
    } else {
        name.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::testing::{write_gguf_fixture, GgufFixture};
    use tempfile::tempdir;

    #[test]
    fn test_empty_directory_lists_nothing() {
        let dir = tempdir().unwrap();
        let inventory = ModelInventory::new(dir.path().to_path_buf());
        assert!(inventory.list_local_models(&|_| None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_typed_error() {
        let dir = tempdir().unwrap();
        let inventory = ModelInventory::new(dir.path().join("nope"));
        assert!(matches!(inventory.list_local_models(&|_| None), Err(LlmError::NotFound(_))));
    }

    #[test]
    fn test_lists_sorted_gguf_files_with_resolver() {
        let dir = tempdir().unwrap();
        write_gguf_fixture(&dir.path().join("zeta-Q8_0.gguf"), &GgufFixture::default()).unwrap();
        write_gguf_fixture(&dir.path().join("alpha-Q4_K_M.gguf"), &GgufFixture::default()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        std::fs::write(dir.path().join("beta.gguf.partial"), b"partial").unwrap();

        let inventory = ModelInventory::new(dir.path().to_path_buf());
        let models = inventory.list_local_models(&|m| Some(m.filename.len() as u32)).unwrap();

        let names: Vec<_> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha-Q4_K_M.gguf", "zeta-Q8_0.gguf"]);
        assert_eq!(models[0].id, "alpha-Q4_K_M");
        assert_eq!(models[0].trained_context_length, Some(4096));
        assert_eq!(models[0].safe_context_size, Some("alpha-Q4_K_M.gguf".len() as u32));
        assert!(models[0].size_bytes > 0);
    }

    #[test]
    fn test_non_gguf_content_still_listed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Mistral-7B-Instruct-v0.3-Q5_K_S.gguf"), b"junk").unwrap();

        let inventory = ModelInventory::new(dir.path().to_path_buf());
        let models = inventory.list_local_models(&|_| None).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].quantization.as_deref(), Some("Q5_K_S"));
        assert_eq!(models[0].trained_context_length, None);
        assert_eq!(models[0].display_name, "Mistral 7B Instruct v0.3");
    }

    #[test]
    fn test_find_model_by_id_or_filename() {
        let dir = tempdir().unwrap();
        write_gguf_fixture(&dir.path().join("Phi-3.5-mini.gguf"), &GgufFixture::default()).unwrap();
        let inventory = ModelInventory::new(dir.path().to_path_buf());

        assert_eq!(inventory.find_model("phi-3.5-mini").unwrap().filename, "Phi-3.5-mini.gguf");
        assert_eq!(inventory.find_model("Phi-3.5-mini.gguf").unwrap().id, "Phi-3.5-mini");
        assert!(matches!(inventory.find_model("other"), Err(LlmError::NotFound(_))));
    }

    #[test]
    fn test_find_model_exact_name_and_missing_root() {
        let dir = tempdir().unwrap();
        write_gguf_fixture(&dir.path().join("Qwen.gguf"), &GgufFixture::default()).unwrap();
        std::fs::write(dir.path().join("broken.gguf"), b"GGUF\xff").unwrap();
        let inventory = ModelInventory::new(dir.path().to_path_buf());

        let model = inventory.find_model("Qwen").unwrap();
        assert_eq!(model.filename, "Qwen.gguf");
        assert_eq!(model.trained_context_length, Some(4096));
        assert!(matches!(
            ModelInventory::new(dir.path().join("missing")).find_model("Qwen"),
            Err(LlmError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let dir = tempdir().unwrap();
        let inventory = ModelInventory::new(dir.path().to_path_buf());

        assert_eq!(
            inventory.resolve_path("model.gguf").unwrap(),
            dir.path().join("model.gguf")
        );
        assert!(inventory.resolve_path("../escape.gguf").is_err());
        assert!(inventory.resolve_path("nested/model.gguf").is_err());
        assert!(inventory.resolve_path("").is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let inventory = ModelInventory::new(dir.path().to_path_buf());
        let path = dir.path().join("gone.gguf");
        std::fs::write(&path, b"x").unwrap();

        inventory.delete_file(&path).unwrap();
        assert!(!path.exists());
        inventory.delete_file(&path).unwrap();
    }

    #[test]
    fn test_quantization_from_filename() {
        assert_eq!(quantization_from_filename("qwen2.5-7b-instruct-q4_k_m.gguf").as_deref(), Some("Q4_K_M"));
        assert_eq!(quantization_from_filename("model.IQ3_XS.gguf").as_deref(), Some("IQ3_XS"));
        assert_eq!(quantization_from_filename("model-f16.gguf").as_deref(), Some("F16"));
        assert_eq!(quantization_from_filename("plain.gguf"), None);
    }
}
