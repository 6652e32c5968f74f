use serde::{Deserialize, Serialize};

/// Default thumbnail edge length in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 150;

const DEFAULT_BLUR_SIGMA: f32 = 3.0;
const DEFAULT_SHARPEN_SIGMA: f32 = 1.0;
const DEFAULT_ROTATE_DEGREES: u32 = 90;

/// A single image transformation step.
///
/// On the wire an operation is `{"operation": <name>, "parameters": {...}}`.
/// Parsing happens exactly once, at the API edge: unknown names and unknown
/// or out-of-range parameters are rejected there, so everything downstream
/// (queue payloads, the worker, the processor) deals in validated variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", content = "parameters", rename_all = "snake_case")]
pub enum Operation {
    /// Scale to the given dimensions. A zero dimension preserves the aspect
    /// ratio; both zero is a no-op.
    Resize { width: u32, height: u32 },
    /// Square crop-and-scale to `size`×`size`.
    Thumbnail { size: u32 },
    Blur { sigma: f32 },
    Sharpen { sigma: f32 },
    Grayscale,
    Sepia,
    /// Quarter-turn rotation; `degrees` must be 90, 180 or 270.
    Rotate { degrees: u32 },
    Flip { direction: FlipDirection },
    /// Percentage adjustment in [-100, 100].
    Brightness { amount: f32 },
    /// Percentage adjustment in [-100, 100].
    Contrast { amount: f32 },
    /// Percentage adjustment in [-100, 100].
    Saturation { amount: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("invalid operations JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    Unknown(String),

    #[error("invalid parameters for {op}: {reason}")]
    InvalidParameters { op: &'static str, reason: String },
}

/// Wire form of an operation before the name is resolved.
#[derive(Debug, Deserialize)]
struct WireOperation {
    operation: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ResizeParams {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ThumbnailParams {
    size: u32,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            size: DEFAULT_THUMBNAIL_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SigmaParams {
    sigma: f32,
}

impl Default for SigmaParams {
    fn default() -> Self {
        Self { sigma: 0.0 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RotateParams {
    degrees: u32,
}

impl Default for RotateParams {
    fn default() -> Self {
        Self {
            degrees: DEFAULT_ROTATE_DEGREES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FlipParams {
    direction: FlipDirection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AmountParams {
    amount: f32,
}

/// Parse and validate a client-supplied operations list.
pub fn parse_operations(raw: &str) -> Result<Vec<Operation>, OperationError> {
    let wire: Vec<WireOperation> = serde_json::from_str(raw)?;
    wire.into_iter().map(Operation::from_wire).collect()
}

/// Operations applied when the client supplies none.
pub fn default_operations() -> Vec<Operation> {
    vec![Operation::Thumbnail {
        size: DEFAULT_THUMBNAIL_SIZE,
    }]
}

impl Operation {
    fn from_wire(wire: WireOperation) -> Result<Self, OperationError> {
        let params = match wire.parameters {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };

        match wire.operation.as_str() {
            "resize" => {
                let p: ResizeParams = typed_params("resize", params)?;
                Ok(Operation::Resize {
                    width: p.width,
                    height: p.height,
                })
            }
            "thumbnail" => {
                let p: ThumbnailParams = typed_params("thumbnail", params)?;
                if p.size == 0 {
                    return Err(OperationError::InvalidParameters {
                        op: "thumbnail",
                        reason: "size must be positive".into(),
                    });
                }
                Ok(Operation::Thumbnail { size: p.size })
            }
            "blur" => {
                let p: SigmaParams = typed_params("blur", params)?;
                let sigma = if p.sigma == 0.0 {
                    DEFAULT_BLUR_SIGMA
                } else {
                    p.sigma
                };
                validate_sigma("blur", sigma)?;
                Ok(Operation::Blur { sigma })
            }
            "sharpen" => {
                let p: SigmaParams = typed_params("sharpen", params)?;
                let sigma = if p.sigma == 0.0 {
                    DEFAULT_SHARPEN_SIGMA
                } else {
                    p.sigma
                };
                validate_sigma("sharpen", sigma)?;
                Ok(Operation::Sharpen { sigma })
            }
            "grayscale" => Ok(Operation::Grayscale),
            "sepia" => Ok(Operation::Sepia),
            "rotate" => {
                let p: RotateParams = typed_params("rotate", params)?;
                if !matches!(p.degrees, 90 | 180 | 270) {
                    return Err(OperationError::InvalidParameters {
                        op: "rotate",
                        reason: format!("degrees must be 90, 180 or 270, got {}", p.degrees),
                    });
                }
                Ok(Operation::Rotate { degrees: p.degrees })
            }
            "flip" => {
                let p: FlipParams = typed_params("flip", params)?;
                Ok(Operation::Flip {
                    direction: p.direction,
                })
            }
            "brightness" => {
                let p: AmountParams = typed_params("brightness", params)?;
                Ok(Operation::Brightness {
                    amount: clamp_amount(p.amount),
                })
            }
            "contrast" => {
                let p: AmountParams = typed_params("contrast", params)?;
                Ok(Operation::Contrast {
                    amount: clamp_amount(p.amount),
                })
            }
            "saturation" => {
                let p: AmountParams = typed_params("saturation", params)?;
                Ok(Operation::Saturation {
                    amount: clamp_amount(p.amount),
                })
            }
            other => Err(OperationError::Unknown(other.to_string())),
        }
    }
}

fn typed_params<T: serde::de::DeserializeOwned>(
    op: &'static str,
    params: serde_json::Value,
) -> Result<T, OperationError> {
    serde_json::from_value(params).map_err(|e| OperationError::InvalidParameters {
        op,
        reason: e.to_string(),
    })
}

fn validate_sigma(op: &'static str, sigma: f32) -> Result<(), OperationError> {
    if !sigma.is_finite() || sigma <= 0.0 || sigma > 100.0 {
        return Err(OperationError::InvalidParameters {
            op,
            reason: format!("sigma must be in (0, 100], got {sigma}"),
        });
    }
    Ok(())
}

fn clamp_amount(amount: f32) -> f32 {
    amount.clamp(-100.0, 100.0)
}

// Queue payloads and job rows carry serialized operations; deserialization
// funnels through the same name resolution and validation as the API edge.
impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireOperation::deserialize(deserializer)?;
        Operation::from_wire(wire).map_err(serde::de::Error::custom)
    }
}
