use std::fs;
use std::path::{Path, PathBuf};

/// Model family, inferred from the file name. Drives backend selection and
/// chat-template choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub path: PathBuf,
    pub family: PromptFamily,
    pub tokenizer_path: Option<PathBuf>,
}

/// GGUF models discovered under the local models directory. Remote model
/// weights are never fetched; only ids resolvable here (or explicit .gguf
/// paths) can be loaded.
#[derive(Debug)]
pub struct ModelCatalog {
    pub models_dir: PathBuf,
    pub entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn discover(models_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let models_dir = models_dir.into();
        let mut gguf_files = Vec::new();
        collect_gguf_files(&models_dir, &mut gguf_files)?;

        let mut entries: Vec<ModelEntry> = gguf_files
            .into_iter()
            .map(|path| {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown-model")
                    .to_string();
                ModelEntry {
                    id: build_model_id(&models_dir, &path),
                    family: infer_family_from_filename(&stem),
                    tokenizer_path: infer_tokenizer_path(&models_dir, &path),
                    path,
                }
            })
            .collect();

        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self {
            models_dir,
            entries,
        })
    }

    pub fn find_by_id(&self, model_id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|m| m.id == model_id)
    }

    /// Resolves a `load` selector: a catalog id first, then an explicit
    /// .gguf path.
    pub fn resolve(&self, selector: &str) -> Result<ModelEntry, String> {
        let raw = selector.trim();
        if raw.is_empty() {
            return Err("empty model selector".to_string());
        }

        if let Some(entry) = self.find_by_id(raw) {
            return Ok(entry.clone());
        }

        if raw.ends_with(".gguf") {
            let path = PathBuf::from(raw);
            if !path.exists() {
                return Err(format!("model path not found: {}", path.display()));
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown-model")
                .to_string();
            return Ok(ModelEntry {
                id: stem.clone(),
                family: infer_family_from_filename(&stem),
                tokenizer_path: infer_tokenizer_path(&self.models_dir, &path),
                path,
            });
        }

        Err(format!(
            "model '{}' not found under {}",
            raw,
            self.models_dir.display()
        ))
    }
}

fn infer_family_from_filename(name: &str) -> PromptFamily {
    let lowered = name.to_lowercase();
    if lowered.contains("llama") {
        PromptFamily::Llama
    } else if lowered.contains("qwen") {
        PromptFamily::Qwen
    } else if lowered.contains("mistral") || lowered.contains("mixtral") {
        PromptFamily::Mistral
    } else {
        PromptFamily::Unknown
    }
}

fn collect_gguf_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = fs::read_dir(dir)
        .map_err(|e| format!("model directory read failed '{}': {}", dir.display(), e))?;

    for entry in entries {
        let path = entry
            .map_err(|e| format!("model directory entry read failed '{}': {}", dir.display(), e))?
            .path();

        if path.is_dir() {
            collect_gguf_files(&path, out)?;
            continue;
        }

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if extension.eq_ignore_ascii_case("gguf") {
            out.push(path);
        }
    }

    Ok(())
}

fn build_model_id(models_dir: &Path, model_path: &Path) -> String {
    let relative = model_path
        .strip_prefix(models_dir)
        .unwrap_or(model_path)
        .to_path_buf();
    let mut without_ext = relative;
    without_ext.set_extension("");
    without_ext.to_string_lossy().replace('\\', "/")
}

fn infer_tokenizer_path(models_dir: &Path, model_path: &Path) -> Option<PathBuf> {
    let model_parent = model_path.parent().unwrap_or(models_dir);
    let local_tok = model_parent.join("tokenizer.json");
    if local_tok.exists() {
        return Some(local_tok);
    }

    let models_tok = models_dir.join("tokenizer.json");
    if models_tok.exists() {
        return Some(models_tok);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn family_inference_from_name() {
        assert_eq!(infer_family_from_filename("Meta-Llama-3-8B"), PromptFamily::Llama);
        assert_eq!(infer_family_from_filename("Qwen2.5-14B"), PromptFamily::Qwen);
        assert_eq!(infer_family_from_filename("Mistral-7B"), PromptFamily::Mistral);
        assert_eq!(infer_family_from_filename("phi-3-mini"), PromptFamily::Unknown);
    }

    #[test]
    fn discovers_models_recursively_with_tokenizer_hint() {
        let base = mk_temp_dir("llm_worker_catalog_recursive");
        let models = base.join("models");
        let llama_dir = models.join("llama3-8b");
        let qwen_dir = models.join("qwen2.5-7b");

        fs::create_dir_all(&llama_dir).expect("create llama dir");
        fs::create_dir_all(&qwen_dir).expect("create qwen dir");
        fs::write(llama_dir.join("Meta-Llama-3-8B-Instruct-Q4_K_M.gguf"), b"stub")
            .expect("write llama stub");
        fs::write(qwen_dir.join("Qwen2.5-7B-Instruct-Q4_K_M.gguf"), b"stub")
            .expect("write qwen stub");
        fs::write(llama_dir.join("tokenizer.json"), b"{}").expect("write tokenizer stub");

        let catalog = ModelCatalog::discover(&models).expect("discover models");
        assert_eq!(catalog.entries.len(), 2);

        let llama = catalog
            .entries
            .iter()
            .find(|e| e.family == PromptFamily::Llama)
            .expect("llama entry present");
        assert!(llama.id.contains("llama3-8b/Meta-Llama-3-8B-Instruct-Q4_K_M"));
        assert!(llama
            .tokenizer_path
            .as_ref()
            .expect("tokenizer hint expected")
            .ends_with("tokenizer.json"));

        let qwen = catalog
            .entries
            .iter()
            .find(|e| e.family == PromptFamily::Qwen)
            .expect("qwen entry present");
        assert!(qwen.tokenizer_path.is_none());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn resolves_by_id_and_by_explicit_path() {
        let base = mk_temp_dir("llm_worker_catalog_resolve");
        let models = base.join("models");
        fs::create_dir_all(&models).expect("create models dir");
        let model_path = models.join("Qwen2.5-7B-Instruct-Q4_K_M.gguf");
        fs::write(&model_path, b"stub").expect("write stub");

        let catalog = ModelCatalog::discover(&models).expect("discover models");

        let by_id = catalog
            .resolve("Qwen2.5-7B-Instruct-Q4_K_M")
            .expect("resolve by id");
        assert_eq!(by_id.path, model_path);
        assert_eq!(by_id.family, PromptFamily::Qwen);

        let by_path = catalog
            .resolve(model_path.to_string_lossy().as_ref())
            .expect("resolve by path");
        assert_eq!(by_path.path, model_path);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let base = mk_temp_dir("llm_worker_catalog_unknown");
        let models = base.join("models");
        fs::create_dir_all(&models).expect("create models dir");

        let catalog = ModelCatalog::discover(&models).expect("discover models");
        assert!(catalog.resolve("does-not-exist").is_err());
        assert!(catalog.resolve("").is_err());
        assert!(catalog.resolve("missing/file.gguf").is_err());

        let _ = fs::remove_dir_all(base);
    }

    fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts))
    }
}
