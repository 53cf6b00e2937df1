use std::fmt;

use serde::{Deserialize, Serialize};

/// One turn of the conversation submitted with a `generate` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Requested weight precision for `load`. The GGUF file fixes the actual
/// quantization; the hint is pinned in the cache and logged so the caller
/// protocol stays compatible with engines that honor it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    #[default]
    Auto,
    Fp16,
    Fp32,
    Q8,
    Q4,
    Q4f16,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::Auto => "auto",
            Dtype::Fp16 => "fp16",
            Dtype::Fp32 => "fp32",
            Dtype::Q8 => "q8",
            Dtype::Q4 => "q4",
            Dtype::Q4f16 => "q4f16",
        };
        f.write_str(name)
    }
}

/// Inbound command envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Command {
    Load {
        model_id: String,
        #[serde(default)]
        dtype: Dtype,
    },
    Generate(Vec<ChatMessage>),
    Interrupt,
    Reset,
}

pub fn parse_command(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::{parse_command, ChatMessage, Command, Dtype};

    #[test]
    fn parses_load_with_dtype() {
        let cmd = parse_command(r#"{"type":"load","data":{"model_id":"llama3-8b","dtype":"q4f16"}}"#)
            .expect("parse load");
        assert_eq!(
            cmd,
            Command::Load {
                model_id: "llama3-8b".to_string(),
                dtype: Dtype::Q4f16,
            }
        );
    }

    #[test]
    fn load_dtype_defaults_to_auto() {
        let cmd = parse_command(r#"{"type":"load","data":{"model_id":"llama3-8b"}}"#)
            .expect("parse load without dtype");
        assert_eq!(
            cmd,
            Command::Load {
                model_id: "llama3-8b".to_string(),
                dtype: Dtype::Auto,
            }
        );
    }

    #[test]
    fn parses_generate_turn_list() {
        let cmd = parse_command(
            r#"{"type":"generate","data":[{"role":"user","content":"Hi"},{"role":"assistant","content":"Hello!"}]}"#,
        )
        .expect("parse generate");
        match cmd {
            Command::Generate(messages) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(
                    messages[0],
                    ChatMessage {
                        role: "user".to_string(),
                        content: "Hi".to_string(),
                    }
                );
            }
            other => panic!("expected generate, got {other:?}"),
        }
    }

    #[test]
    fn parses_bare_interrupt_and_reset() {
        assert_eq!(
            parse_command(r#"{"type":"interrupt"}"#).expect("parse interrupt"),
            Command::Interrupt
        );
        assert_eq!(
            parse_command(r#"{"type":"reset"}"#).expect("parse reset"),
            Command::Reset
        );
    }

    #[test]
    fn unknown_command_type_is_an_error() {
        assert!(parse_command(r#"{"type":"shutdown"}"#).is_err());
        assert!(parse_command("not json at all").is_err());
    }

    #[test]
    fn load_with_malformed_data_is_an_error() {
        assert!(parse_command(r#"{"type":"load","data":{"dtype":"q4"}}"#).is_err());
        assert!(parse_command(r#"{"type":"generate","data":"Hi"}"#).is_err());
    }
}
