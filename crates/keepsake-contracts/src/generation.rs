use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_STYLE_PROMPT: &str = "highest quality, professional sketch, monochrome";
pub const DEFAULT_MEMORY_STYLE_PROMPT: &str =
    "highest quality, monochrome, professional sketch, personal, nostalgic, clean";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "error, glitch, mistake";
pub const DEFAULT_INFERENCE_STEPS: u32 = 50;
/// Left, front, right.
pub const MULTI_ANGLE_PANELS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Subject,
    Memory,
    MultiAngle,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Memory => "memory",
            Self::MultiAngle => "multi_angle",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "subject" | "avatar" => Some(Self::Subject),
            "memory" => Some(Self::Memory),
            "multi_angle" | "angles" => Some(Self::MultiAngle),
            _ => None,
        }
    }

    /// Number of horizontal panels the provider is asked to render.
    pub fn panels(self) -> u32 {
        match self {
            Self::MultiAngle => MULTI_ANGLE_PANELS,
            Self::Subject | Self::Memory => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleParams {
    #[serde(default = "default_style_prompt")]
    pub style_prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_inference_steps")]
    pub num_inference_steps: u32,
    #[serde(default)]
    pub ip_adapter_scale: Option<f64>,
}

impl Default for StyleParams {
    fn default() -> Self {
        Self {
            style_prompt: default_style_prompt(),
            negative_prompt: default_negative_prompt(),
            num_inference_steps: default_inference_steps(),
            ip_adapter_scale: None,
        }
    }
}

/// A caller-facing generation request. Reference images are BlobStore URIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub owner_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default)]
    pub reference_labels: Vec<String>,
    #[serde(default)]
    pub style: StyleParams,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationRequest {
    pub fn subject(owner_id: impl Into<String>) -> Self {
        Self::new(GenerationKind::Subject, owner_id)
    }

    pub fn memory(owner_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let mut request = Self::new(GenerationKind::Memory, owner_id);
        request.prompt = Some(prompt.into());
        request.style.style_prompt = DEFAULT_MEMORY_STYLE_PROMPT.to_string();
        request
    }

    pub fn multi_angle(owner_id: impl Into<String>, reference_images: Vec<String>) -> Self {
        let mut request = Self::new(GenerationKind::MultiAngle, owner_id);
        request.reference_images = reference_images;
        request
    }

    pub fn new(kind: GenerationKind, owner_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            prompt: None,
            reference_images: Vec::new(),
            reference_labels: Vec::new(),
            style: StyleParams::default(),
            adapter_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_references(mut self, reference_images: Vec<String>) -> Self {
        self.reference_images = reference_images;
        self
    }

    pub fn with_adapter(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub image_uri: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Replaces inline image payloads with a marker before a payload is logged.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data" | "api_key"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn default_style_prompt() -> String {
    DEFAULT_STYLE_PROMPT.to_string()
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

fn default_inference_steps() -> u32 {
    DEFAULT_INFERENCE_STEPS
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{sanitize_payload, GenerationKind, GenerationRequest, DEFAULT_NEGATIVE_PROMPT};

    #[test]
    fn request_defaults_fill_style_pair() -> anyhow::Result<()> {
        let parsed: GenerationRequest = serde_json::from_value(json!({
            "kind": "memory",
            "owner_id": "u1",
            "prompt": "first day of school",
        }))?;
        assert_eq!(parsed.kind, GenerationKind::Memory);
        assert_eq!(parsed.style.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(parsed.style.num_inference_steps, 50);
        assert!(parsed.reference_images.is_empty());
        Ok(())
    }

    #[test]
    fn kind_parse_and_panel_count() {
        assert_eq!(GenerationKind::parse("multi-angle"), Some(GenerationKind::MultiAngle));
        assert_eq!(GenerationKind::parse("Subject"), Some(GenerationKind::Subject));
        assert_eq!(GenerationKind::parse("poster"), None);
        assert_eq!(GenerationKind::MultiAngle.panels(), 3);
        assert_eq!(GenerationKind::Memory.panels(), 1);
    }

    #[test]
    fn sanitize_payload_omits_inline_images() {
        let payload = json!({
            "prompt": "p",
            "data": [{"b64_json": "AAAA"}],
            "nested": {"image": "AAAA", "keep": 1},
        });
        let cleaned = sanitize_payload(&payload);
        assert_eq!(cleaned["prompt"], json!("p"));
        assert_eq!(cleaned["data"], Value::String("<omitted>".to_string()));
        assert_eq!(cleaned["nested"]["image"], json!("<omitted>"));
        assert_eq!(cleaned["nested"]["keep"], json!(1));
    }
}
