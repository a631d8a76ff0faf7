use crate::config::config::VisionCfg;
use crate::core::error::{classify_status, classify_transport};
use crate::core::types::{BlockKind, BoundingBox, ImageLabel, OcrBlock};
use crate::vision::capability::VisionCapability;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    blocks: Vec<AnnotatedBlock>,
    #[serde(default)]
    labels: Vec<AnnotatedLabel>,
}

#[derive(Debug, Deserialize)]
struct AnnotatedBlock {
    text: String,
    confidence: f64,
    #[serde(rename = "boundingBox")]
    bounding_box: AnnotatedBox,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotatedBox {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct AnnotatedLabel {
    name: String,
    confidence: f64,
}

/// Vision endpoint client. Posts base64 image payloads to a text/label
/// annotation service with a Rekognition-style response shape.
pub struct HttpVisionClient {
    client: Client,
    cfg: VisionCfg,
}

impl HttpVisionClient {
    pub fn new(cfg: VisionCfg, client: Client) -> Self {
        Self { client, cfg }
    }

    async fn annotate(&self, image: &[u8], features: &[&str]) -> Result<AnnotateResponse> {
        use base64::Engine;

        let body = json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "features": features,
        });

        let resp = self
            .client
            .post(format!("{}/annotate", self.cfg.base_url))
            .timeout(self.cfg.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, "vision annotate"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, "vision annotate").into());
        }

        resp.json::<AnnotateResponse>()
            .await
            .context("parsing vision annotate response")
    }
}

#[async_trait]
impl VisionCapability for HttpVisionClient {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<OcrBlock>> {
        let resp = self.annotate(image, &["TEXT"]).await?;
        Ok(resp
            .blocks
            .into_iter()
            .map(|b| OcrBlock {
                text: b.text,
                confidence: b.confidence.clamp(0.0, 1.0),
                bounding_box: BoundingBox {
                    left: b.bounding_box.left,
                    top: b.bounding_box.top,
                    width: b.bounding_box.width,
                    height: b.bounding_box.height,
                },
                kind: match b.kind.as_deref() {
                    Some("WORD") => BlockKind::Word,
                    _ => BlockKind::Line,
                },
            })
            .collect())
    }

    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<ImageLabel>> {
        let resp = self.annotate(image, &["LABELS"]).await?;
        Ok(resp
            .labels
            .into_iter()
            .map(|l| ImageLabel {
                name: l.name,
                confidence: l.confidence.clamp(0.0, 1.0),
            })
            .collect())
    }
}
