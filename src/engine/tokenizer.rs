use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use minijinja::value::Value;
use minijinja::{context, Environment};
use tokenizers::Tokenizer;

use crate::catalog::PromptFamily;
use crate::protocol::ChatMessage;

use super::ChatTokenizer;

const LLAMA3_TEMPLATE: &str = "{% for m in messages %}<|start_header_id|>{{ m.role }}<|end_header_id|>\n\n{{ m.content }}<|eot_id|>{% endfor %}{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}";

const QWEN_TEMPLATE: &str = "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const MISTRAL_TEMPLATE: &str = "{% for m in messages %}{% if m.role == 'system' %}[INST] [SYSTEM] {{ m.content }} [/SYSTEM] [/INST]{% elif m.role == 'user' %}[INST] {{ m.content }} [/INST]{% else %}{{ m.content }}</s>{% endif %}{% endfor %}";

const FALLBACK_TEMPLATE: &str = "{% for m in messages %}[{{ m.role }}]\n{{ m.content }}\n[/{{ m.role }}]\n{% endfor %}{% if add_generation_prompt %}[assistant]\n{% endif %}";

fn template_source(family: PromptFamily) -> &'static str {
    match family {
        PromptFamily::Llama => LLAMA3_TEMPLATE,
        PromptFamily::Qwen => QWEN_TEMPLATE,
        PromptFamily::Mistral => MISTRAL_TEMPLATE,
        PromptFamily::Unknown => FALLBACK_TEMPLATE,
    }
}

/// Flattens conversation turns into the family's prompt format.
pub fn render_chat_prompt(
    family: PromptFamily,
    messages: &[ChatMessage],
    add_generation_prompt: bool,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("chat", template_source(family))?;
    let rendered = env.get_template("chat")?.render(context! {
        messages => Value::from_serialize(messages),
        add_generation_prompt => add_generation_prompt,
    })?;
    Ok(rendered)
}

/// The real tokenizer behind the `ChatTokenizer` capability.
pub struct HfTokenizer {
    inner: Tokenizer,
    family: PromptFamily,
    eos_token_id: u32,
    eot_token_id: u32,
}

impl HfTokenizer {
    pub fn new(inner: Tokenizer, family: PromptFamily) -> Result<Self> {
        let (eos_token_id, eot_token_id) = resolve_special_tokens(&inner, family).map_err(E::msg)?;
        Ok(Self {
            inner,
            family,
            eos_token_id,
            eot_token_id,
        })
    }
}

impl ChatTokenizer for HfTokenizer {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        let prompt = render_chat_prompt(self.family, messages, add_generation_prompt)?;
        self.encode(&prompt)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true).map_err(E::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner.decode(tokens, skip_special_tokens).map_err(E::msg)
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|seq| self.decode(seq, skip_special_tokens))
            .collect()
    }

    fn is_stop_token(&self, token: u32) -> bool {
        token == self.eos_token_id || token == self.eot_token_id
    }
}

/// Finds the tokenizer.json for a model: catalog hint first, then the model's
/// directory, then the models root.
pub fn resolve_tokenizer_path(model_path: &Path, tokenizer_hint: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint);
        }
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

/// Fail-fast check that the tokenizer actually carries the family's control
/// tokens. Returns (eos, eot).
pub fn resolve_special_tokens(
    tokenizer: &Tokenizer,
    family: PromptFamily,
) -> Result<(u32, u32), String> {
    match family {
        PromptFamily::Llama => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "tokenizer/model incompatibility: Llama requires <|end_of_text|> or </s>"
                        .to_string()
                })?;

            let eot = tokenizer.token_to_id("<|eot_id|>").ok_or_else(|| {
                "tokenizer/model incompatibility: Llama template requires <|eot_id|>".to_string()
            })?;

            let has_headers = tokenizer.token_to_id("<|start_header_id|>").is_some()
                && tokenizer.token_to_id("<|end_header_id|>").is_some();
            if !has_headers {
                return Err(
                    "tokenizer/model incompatibility: missing Llama chat header tokens".to_string(),
                );
            }

            Ok((eos, eot))
        }
        PromptFamily::Qwen => {
            let eos = tokenizer
                .token_to_id("<|endoftext|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "tokenizer/model incompatibility: Qwen requires <|endoftext|> or </s>"
                        .to_string()
                })?;

            let eot = tokenizer.token_to_id("<|im_end|>").ok_or_else(|| {
                "tokenizer/model incompatibility: Qwen template requires <|im_end|>".to_string()
            })?;

            if tokenizer.token_to_id("<|im_start|>").is_none() {
                return Err(
                    "tokenizer/model incompatibility: Qwen template requires <|im_start|>"
                        .to_string(),
                );
            }

            Ok((eos, eot))
        }
        PromptFamily::Mistral => {
            let eos = tokenizer
                .token_to_id("</s>")
                .or_else(|| tokenizer.token_to_id("<|end_of_text|>"))
                .ok_or_else(|| {
                    "tokenizer/model incompatibility: Mistral requires </s> or <|end_of_text|>"
                        .to_string()
                })?;
            Ok((eos, eos))
        }
        PromptFamily::Unknown => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
                .unwrap_or(2);
            Ok((eos, eos))
        }
    }
}
