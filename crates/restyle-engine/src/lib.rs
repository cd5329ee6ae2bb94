use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use indexmap::IndexMap;
use rand::Rng;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use restyle_contracts::analysis::{
    DetectedObject, DominantColor, ImageLabel, LabelSet, Point, TextFragment, VisionAnalysis,
};
use restyle_contracts::chat::Transcript;
use restyle_contracts::events::{EventPayload, EventWriter};
use restyle_contracts::products::{Product, PLACEHOLDER_URL};
use restyle_contracts::session::RedesignSession;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const OUTPUT_FILE_NAME: &str = "RedesignedRoom.png";

/// Authoritative step count sent to the generation service.
pub const INFERENCE_STEPS: u32 = 60;
/// Step count quoted on the informational metadata line. Kept separate from
/// [`INFERENCE_STEPS`]; only the execution value binds.
pub const DISPLAYED_STEPS: u32 = 50;
pub const GUIDANCE_SCALE: f64 = 8.0;
const DISPLAYED_GUIDANCE: f64 = 7.5;
/// Seeds are drawn uniformly from `0..SEED_SPAN` at generation time.
pub const SEED_SPAN: u32 = 100_000;

const DIMENSION_MULTIPLE: u32 = 16;
const PROMPT_OBJECT_LIMIT: usize = 3;
const PROMPT_TEXT_LIMIT: usize = 2;
const PRODUCT_RESULT_LIMIT: usize = 5;

const GENERATION_TIMEOUT_SECONDS: u64 = 60;
const ASSISTANT_TIMEOUT_SECONDS: u64 = 30;

const VISION_PROVIDER: &str = "Google Vision";
const GENERATION_PROVIDER: &str = "hosted diffusion";
const ASSISTANT_PROVIDER: &str = "assistant";

const DEFAULT_VISION_API_BASE: &str = "https://vision.googleapis.com/v1";
const DEFAULT_GENERATION_URL: &str =
    "https://api-inference.huggingface.co/models/stabilityai/stable-diffusion-xl-base-1.0";
const DEFAULT_SEARCH_API_BASE: &str = "https://serpapi.com";
const DEFAULT_SEARCH_SHAPE: &str = "google-shopping";
const DEFAULT_ASSISTANT_API_BASE: &str = "https://api.groq.com/openai/v1";
const DEFAULT_ASSISTANT_MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";

const NEGATIVE_PROMPT: &str = "blurry, deformed, low quality, empty room, white walls, \
low realism, bad lighting, wrong proportions, missing objects, flat textures, \
simplified geometry";

pub const ASSISTANT_SYSTEM_PROMPT: &str = "You are a helpful interior-design assistant.";

/// Room/structure nouns that never count as newly introduced décor.
pub const ROOM_STOPWORDS: &[&str] = &[
    "wall",
    "floor",
    "ceiling",
    "room",
    "house",
    "lighting",
    "wood",
    "window",
    "interior design",
    "home",
    "architecture",
    "tile",
    "fixture",
    "living room",
    "dining room",
    "bedroom",
    "kitchen",
    "bathroom",
    "hallway",
    "office",
    "study",
    "closet",
    "garage",
    "laundry room",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required secret {0} is not set")]
    MissingSecret(&'static str),
    #[error("unknown product-search provider '{requested}' (available: {available:?})")]
    UnknownSearchProvider {
        requested: String,
        available: Vec<String>,
    },
}

/// Failure of a vision/generation/assistant call. Carries the provider name
/// and, whenever one is available, the raw response body so the UI can show
/// the provider's own message.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request could not be prepared: {detail}")]
    Request {
        provider: &'static str,
        detail: String,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} request failed ({status}): {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} response missing expected envelope: {body}")]
    MissingEnvelope {
        provider: &'static str,
        body: String,
    },
    #[error("{provider} returned an empty response envelope: {body}")]
    EmptyEnvelope {
        provider: &'static str,
        body: String,
    },
    #[error("{provider} reported an error: {message}")]
    Remote {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned an undecodable payload: {detail}")]
    Payload {
        provider: &'static str,
        detail: String,
    },
}

/// Product-search failure. Always converted to the placeholder product by the
/// orchestrator; one bad label lookup never aborts the rest of the pipeline.
#[derive(Debug, Error)]
#[error("product lookup for '{label}' failed: {reason}")]
pub struct LookupError {
    pub label: String,
    pub reason: String,
}

pub fn require_secret(key: &'static str) -> Result<String, ConfigError> {
    non_empty_env(key).ok_or(ConfigError::MissingSecret(key))
}

pub trait VisionAnnotator: Send + Sync {
    fn annotate(&self, image: &DynamicImage) -> Result<VisionAnalysis, ProviderError>;
}

pub struct VisionClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl VisionClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(
            api_base_from_env("RESTYLE_VISION_API_BASE", DEFAULT_VISION_API_BASE),
            require_secret("GOOGLE_VISION_API_KEY")?,
        ))
    }
}

impl VisionAnnotator for VisionClient {
    fn annotate(&self, image: &DynamicImage) -> Result<VisionAnalysis, ProviderError> {
        let content = encode_jpeg_base64(image)?;
        let body = json!({
            "requests": [{
                "image": {"content": content},
                "features": [
                    {"type": "LABEL_DETECTION"},
                    {"type": "OBJECT_LOCALIZATION"},
                    {"type": "IMAGE_PROPERTIES"},
                    {"type": "TEXT_DETECTION"},
                ],
            }]
        });
        let response = self
            .http
            .post(format!("{}/images:annotate", self.api_base))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|source| ProviderError::Transport {
                provider: VISION_PROVIDER,
                source,
            })?;
        let payload = response_json_or_error(VISION_PROVIDER, response)?;
        let first = first_annotate_response(&payload)?;
        Ok(parse_vision_analysis(first))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub positive: String,
    pub negative: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
}

impl GenerationPrompt {
    /// Informational sampler line shown alongside the prompt. Display only;
    /// the execution parameters live on the struct fields.
    pub fn metadata_line(&self) -> String {
        format!(
            "Steps: {DISPLAYED_STEPS}, Sampler: DPM++ 2M Karras, CFG scale: {DISPLAYED_GUIDANCE}, Size: {}x{}",
            self.width, self.height
        )
    }
}

/// Pure prompt construction from one vision analysis and the user's style
/// request. The seed draw is deliberately not part of synthesis.
pub struct PromptSynthesizer {
    lexicon: IndexMap<&'static str, &'static str>,
}

impl Default for PromptSynthesizer {
    fn default() -> Self {
        Self {
            lexicon: default_style_lexicon(),
        }
    }
}

impl PromptSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synthesize(
        &self,
        analysis: &VisionAnalysis,
        style_text: &str,
        source_width: u32,
        source_height: u32,
    ) -> GenerationPrompt {
        let mut ranked: Vec<&DetectedObject> = analysis.objects.iter().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let object_clauses: Vec<String> = ranked
            .iter()
            .take(PROMPT_OBJECT_LIMIT)
            .map(|object| format!("{} at {}", object.name, format_bounds(&object.bounds)))
            .collect();

        let color = dominant_color(&analysis.colors);
        let color_clause = format!(
            "RGB({}, {}, {})",
            color.red as i64, color.green as i64, color.blue as i64
        );

        let lowered = style_text.to_lowercase();
        let enhancement = self
            .lexicon
            .iter()
            .find(|(key, _)| lowered.contains(*key))
            .map(|(_, value)| *value)
            .unwrap_or("");
        let style_clause = if enhancement.is_empty() {
            format!("Style to apply: {style_text}.")
        } else {
            format!("Style to apply: {style_text}. {enhancement}")
        };

        let text_clauses: Vec<String> = analysis
            .text
            .iter()
            .take(PROMPT_TEXT_LIMIT)
            .map(|fragment| {
                format!(
                    "Text \"{}\" at {}",
                    fragment.text,
                    format_bounds(&fragment.bounds)
                )
            })
            .collect();

        let mut lines: Vec<String> = vec![
            "Interior render of a real room.".to_string(),
            "Preserve all structural elements: walls, ceiling, flooring, lighting, and windows."
                .to_string(),
            "Do not remove existing elements like furniture, shelves, plants, or décor."
                .to_string(),
            "Keep the existing layout and perspective intact.".to_string(),
            "Add only the necessary furniture, colors, and decorations matching the requested style."
                .to_string(),
            style_clause,
        ];
        if !object_clauses.is_empty() {
            lines.push(format!("Scene includes: {}.", object_clauses.join(", ")));
        }
        if !text_clauses.is_empty() {
            lines.push(format!("Text elements: {}", text_clauses.join("; ")));
        }
        lines.push(format!("Color reference: {color_clause}"));
        lines.push("Do not introduce empty spaces or large blank walls.".to_string());
        lines.push("Do not alter the room's lighting setup or geometry.".to_string());
        lines.push(
            "Render at ultra high resolution with natural light, realistic materials, soft shadows."
                .to_string(),
        );

        GenerationPrompt {
            positive: lines.join(" "),
            negative: NEGATIVE_PROMPT.to_string(),
            width: snap_multiple(source_width, DIMENSION_MULTIPLE),
            height: snap_multiple(source_height, DIMENSION_MULTIPLE),
            steps: INFERENCE_STEPS,
            guidance_scale: GUIDANCE_SCALE,
        }
    }
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, prompt: &GenerationPrompt, seed: u32) -> Result<DynamicImage, ProviderError>;
}

#[derive(Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Box::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageGenerator> {
        self.generators.get(name).map(|generator| generator.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn default_generator_registry() -> GeneratorRegistry {
    let mut generators = GeneratorRegistry::new();
    generators.register(DryrunGenerator);
    generators.register(HostedDiffusionGenerator::new());
    generators
}

/// Offline generator: a solid-color canvas derived from the prompt and seed.
pub struct DryrunGenerator;

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, prompt: &GenerationPrompt, seed: u32) -> Result<DynamicImage, ProviderError> {
        let (r, g, b) = color_from_prompt(&prompt.positive, seed);
        let mut image = RgbImage::new(prompt.width.max(1), prompt.height.max(1));
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        Ok(DynamicImage::ImageRgb8(image))
    }
}

pub struct HostedDiffusionGenerator {
    endpoint: String,
    http: HttpClient,
}

impl HostedDiffusionGenerator {
    pub fn new() -> Self {
        Self {
            endpoint: env::var("RESTYLE_GENERATION_URL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_GENERATION_URL.to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("HF_API_TOKEN").or_else(|| non_empty_env("HF_TOKEN"))
    }

    /// Startup check: the generation token must exist before any request.
    pub fn credentials_available() -> bool {
        Self::api_key().is_some()
    }
}

impl Default for HostedDiffusionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerator for HostedDiffusionGenerator {
    fn name(&self) -> &str {
        "hosted-sd"
    }

    fn generate(&self, prompt: &GenerationPrompt, seed: u32) -> Result<DynamicImage, ProviderError> {
        let Some(token) = Self::api_key() else {
            return Err(ProviderError::Request {
                provider: GENERATION_PROVIDER,
                detail: "HF_API_TOKEN is not set".to_string(),
            });
        };
        let payload = json!({
            "inputs": prompt.positive,
            "parameters": {
                "negative_prompt": prompt.negative,
                "width": prompt.width,
                "height": prompt.height,
                "num_inference_steps": prompt.steps,
                "guidance_scale": prompt.guidance_scale,
                "seed": seed,
            }
        });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&token)
            .timeout(Duration::from_secs(GENERATION_TIMEOUT_SECONDS))
            .json(&payload)
            .send()
            .map_err(|source| ProviderError::Transport {
                provider: GENERATION_PROVIDER,
                source,
            })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .map_err(|source| ProviderError::Transport {
                provider: GENERATION_PROVIDER,
                source,
            })?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: GENERATION_PROVIDER,
                status: status.as_u16(),
                body: truncate_text(&String::from_utf8_lossy(&bytes), 512),
            });
        }
        image::load_from_memory(&bytes).map_err(|err| ProviderError::Payload {
            provider: GENERATION_PROVIDER,
            detail: format!(
                "image decode failed ({err}): {}",
                truncate_text(&String::from_utf8_lossy(&bytes), 512)
            ),
        })
    }
}

/// Labels present in `after` but not `before`, with room/structure nouns
/// filtered out. An empty result is a normal outcome, not a failure.
///
/// Only presence of the label string matters; a label present in both images
/// with different scores is not reported.
pub fn diff_labels(before: &LabelSet, after: &LabelSet, stopwords: &[&str]) -> Vec<String> {
    after
        .difference(before)
        .filter(|label| {
            let lowered = label.to_lowercase();
            !stopwords
                .iter()
                .any(|stopword| lowered.contains(&stopword.to_lowercase()))
        })
        .cloned()
        .collect()
}

/// One provider response shape. Adding a search backend means adding an
/// adapter here, not branching in caller code.
pub trait SearchShape: Send + Sync {
    fn name(&self) -> &str;
    /// Value for the search service's `engine` query parameter.
    fn engine(&self) -> &str;
    fn normalize(&self, payload: &Value) -> Vec<Product>;
}

/// Generic shopping results: `shopping_results` rows with `title`/`link`.
pub struct GoogleShoppingShape;

impl SearchShape for GoogleShoppingShape {
    fn name(&self) -> &str {
        "google-shopping"
    }

    fn engine(&self) -> &str {
        "google_shopping"
    }

    fn normalize(&self, payload: &Value) -> Vec<Product> {
        payload
            .get("shopping_results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .take(PRODUCT_RESULT_LIMIT)
                    .map(|row| Product {
                        name: row
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown Item")
                            .to_string(),
                        url: row
                            .get("link")
                            .and_then(Value::as_str)
                            .unwrap_or(PLACEHOLDER_URL)
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Marketplace organic results: `organic_results` rows with `title` and a
/// `link`-or-`url` fallback.
pub struct MarketplaceShape;

impl SearchShape for MarketplaceShape {
    fn name(&self) -> &str {
        "marketplace"
    }

    fn engine(&self) -> &str {
        "ebay"
    }

    fn normalize(&self, payload: &Value) -> Vec<Product> {
        payload
            .get("organic_results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .take(PRODUCT_RESULT_LIMIT)
                    .map(|row| Product {
                        name: row
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown Item")
                            .to_string(),
                        url: row
                            .get("link")
                            .or_else(|| row.get("url"))
                            .and_then(Value::as_str)
                            .unwrap_or(PLACEHOLDER_URL)
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct SearchShapeRegistry {
    shapes: BTreeMap<String, Box<dyn SearchShape>>,
}

impl SearchShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: SearchShape + 'static>(&mut self, shape: S) {
        self.shapes.insert(shape.name().to_string(), Box::new(shape));
    }

    pub fn take(&mut self, name: &str) -> Option<Box<dyn SearchShape>> {
        self.shapes.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.shapes.keys().cloned().collect()
    }
}

pub fn default_search_shapes() -> SearchShapeRegistry {
    let mut shapes = SearchShapeRegistry::new();
    shapes.register(GoogleShoppingShape);
    shapes.register(MarketplaceShape);
    shapes
}

pub trait ProductSource: Send + Sync {
    fn resolve(&self, label: &str) -> Result<Vec<Product>, LookupError>;
}

pub struct ProductResolver {
    api_base: String,
    api_key: String,
    shape: Box<dyn SearchShape>,
    http: HttpClient,
}

impl ProductResolver {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        shape: Box<dyn SearchShape>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            shape,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = require_secret("SERPAPI_KEY")?;
        let mut shapes = default_search_shapes();
        let requested =
            non_empty_env("RESTYLE_SEARCH_PROVIDER").unwrap_or_else(|| DEFAULT_SEARCH_SHAPE.to_string());
        let available = shapes.names();
        let shape = shapes
            .take(&requested)
            .ok_or(ConfigError::UnknownSearchProvider {
                requested,
                available,
            })?;
        Ok(Self::new(
            api_base_from_env("RESTYLE_SEARCH_API_BASE", DEFAULT_SEARCH_API_BASE),
            api_key,
            shape,
        ))
    }
}

impl ProductSource for ProductResolver {
    fn resolve(&self, label: &str) -> Result<Vec<Product>, LookupError> {
        let query = format!("{label} interior furniture");
        let lookup_error = |reason: String| LookupError {
            label: label.to_string(),
            reason,
        };
        let response = self
            .http
            .get(format!("{}/search.json", self.api_base))
            .query(&[
                ("q", query.as_str()),
                ("engine", self.shape.engine()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .map_err(|err| lookup_error(err.to_string()))?;
        let status = response.status();
        let body = response.text().map_err(|err| lookup_error(err.to_string()))?;
        if !status.is_success() {
            return Err(lookup_error(format!(
                "search request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 256)
            )));
        }
        let payload: Value = serde_json::from_str(&body)
            .map_err(|_| lookup_error(format!("invalid JSON payload: {}", truncate_text(&body, 256))))?;
        Ok(self.shape.normalize(&payload))
    }
}

/// The single entry shown when a lookup fails.
pub fn placeholder_products() -> Vec<Product> {
    vec![Product {
        name: "Error fetching products".to_string(),
        url: PLACEHOLDER_URL.to_string(),
    }]
}

/// Stateless wrapper around the chat-completions endpoint. The caller owns
/// the transcript; one call maps one user message to one assistant reply.
pub struct AssistantClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl AssistantClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(
            api_base_from_env("RESTYLE_ASSISTANT_API_BASE", DEFAULT_ASSISTANT_API_BASE),
            require_secret("GROQ_API_KEY")?,
            non_empty_env("RESTYLE_ASSISTANT_MODEL")
                .unwrap_or_else(|| DEFAULT_ASSISTANT_MODEL.to_string()),
        ))
    }

    pub fn reply(&self, history: &Transcript, user_message: &str) -> Result<String, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": history.to_messages(ASSISTANT_SYSTEM_PROMPT, user_message),
            "temperature": 0.7,
            "max_tokens": 512,
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(ASSISTANT_TIMEOUT_SECONDS))
            .json(&payload)
            .send()
            .map_err(|source| ProviderError::Transport {
                provider: ASSISTANT_PROVIDER,
                source,
            })?;
        let payload = response_json_or_error(ASSISTANT_PROVIDER, response)?;
        assistant_reply_from_payload(&payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub label: String,
    pub products: Vec<Product>,
}

#[derive(Debug, Clone)]
pub struct RedesignOutcome {
    pub output_path: PathBuf,
    pub prompt: GenerationPrompt,
    /// `None` when the generated image came from the session cache.
    pub seed: Option<u32>,
    pub cached: bool,
    pub new_items: Vec<String>,
    pub recommendations: Vec<Recommendation>,
}

/// Owns the session and runs the pipeline:
/// analyze(before) → synthesize → generate → analyze(after) → diff → resolve.
/// Each result is a strict dependency of the next; there is no concurrency.
pub struct RedesignEngine {
    out_dir: PathBuf,
    session: RedesignSession,
    events: EventWriter,
    vision: Box<dyn VisionAnnotator>,
    synthesizer: PromptSynthesizer,
    generators: GeneratorRegistry,
    generator: String,
    resolver: Box<dyn ProductSource>,
}

impl RedesignEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        vision: Box<dyn VisionAnnotator>,
        resolver: Box<dyn ProductSource>,
        generators: GeneratorRegistry,
        generator: impl Into<String>,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let session_id = Uuid::new_v4().to_string();
        let events = EventWriter::new(events_path.into(), session_id);
        let generator = generator.into();
        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": out_dir.to_string_lossy(),
                "generator": generator,
            })),
        )?;

        Ok(Self {
            out_dir,
            session: RedesignSession::new(),
            events,
            vision,
            synthesizer: PromptSynthesizer::new(),
            generators,
            generator,
            resolver,
        })
    }

    pub fn from_env(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        generator: impl Into<String>,
    ) -> Result<Self> {
        let vision = VisionClient::from_env()?;
        let resolver = ProductResolver::from_env()?;
        Self::new(
            out_dir,
            events_path,
            Box::new(vision),
            Box::new(resolver),
            default_generator_registry(),
            generator,
        )
    }

    pub fn session(&self) -> &RedesignSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RedesignSession {
        &mut self.session
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn load_room(&mut self, path: &Path) -> Result<()> {
        let image = image::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let image = DynamicImage::ImageRgb8(image.to_rgb8());
        self.emit(
            "room_loaded",
            map_object(json!({
                "path": path.to_string_lossy(),
                "width": image.width(),
                "height": image.height(),
            })),
        );
        self.session.set_room(image);
        Ok(())
    }

    pub fn set_room(&mut self, image: DynamicImage) {
        self.session.set_room(image);
    }

    pub fn set_style(&mut self, style_text: &str) {
        self.session.set_style(style_text);
    }

    pub fn redesign(&mut self, style_text: &str) -> Result<RedesignOutcome> {
        let Some(source) = self.session.room().cloned() else {
            bail!("no room image loaded; load a room photo first");
        };
        self.session.set_style(style_text);

        let width = snap_multiple(source.width(), DIMENSION_MULTIPLE);
        let height = snap_multiple(source.height(), DIMENSION_MULTIPLE);
        if width == 0 || height == 0 {
            bail!(
                "room image is too small to redesign ({}x{})",
                source.width(),
                source.height()
            );
        }
        let room = if (width, height) != (source.width(), source.height()) {
            source.resize_exact(width, height, FilterType::Lanczos3)
        } else {
            source
        };

        let before = match self.session.before_analysis() {
            Some(analysis) => analysis.clone(),
            None => {
                let analysis = self.stage("analysis", self.vision.annotate(&room))?;
                self.emit(
                    "analysis_completed",
                    map_object(json!({
                        "image": "before",
                        "labels": analysis.labels.len(),
                        "objects": analysis.objects.len(),
                    })),
                );
                self.session.record_analysis(analysis.clone());
                analysis
            }
        };
        let before_labels = before.label_set();

        let prompt = self
            .synthesizer
            .synthesize(&before, style_text, room.width(), room.height());
        self.emit(
            "prompt_synthesized",
            map_object(json!({
                "style": style_text,
                "width": prompt.width,
                "height": prompt.height,
                "metadata": prompt.metadata_line(),
            })),
        );

        let (generated, seed, cached) = match self.session.generated() {
            Some(image) => (image.clone(), None, true),
            None => {
                let generator = self.generators.get(&self.generator).ok_or_else(|| {
                    anyhow::anyhow!(
                        "unknown generator '{}' (available: {:?})",
                        self.generator,
                        self.generators.names()
                    )
                })?;
                let seed = draw_seed();
                let image = self.stage("generation", generator.generate(&prompt, seed))?;
                self.emit(
                    "image_generated",
                    map_object(json!({
                        "generator": self.generator,
                        "seed": seed,
                        "artifact_id": short_id(&prompt.positive, seed),
                        "width": image.width(),
                        "height": image.height(),
                    })),
                );
                (image, Some(seed), false)
            }
        };
        if !cached {
            self.session.record_generated(generated.clone());
        }

        let after = self.stage("analysis", self.vision.annotate(&generated))?;
        self.emit(
            "analysis_completed",
            map_object(json!({
                "image": "after",
                "labels": after.labels.len(),
            })),
        );

        let new_items = diff_labels(&before_labels, &after.label_set(), ROOM_STOPWORDS);
        self.emit(
            "labels_diffed",
            map_object(json!({
                "new_items": new_items,
                "count": new_items.len(),
            })),
        );

        let mut recommendations = Vec::with_capacity(new_items.len());
        for label in &new_items {
            let products = match self.resolver.resolve(label) {
                Ok(products) => products,
                Err(err) => {
                    self.emit(
                        "product_lookup_failed",
                        map_object(json!({
                            "label": label,
                            "error": err.to_string(),
                        })),
                    );
                    placeholder_products()
                }
            };
            self.emit(
                "products_resolved",
                map_object(json!({
                    "label": label,
                    "count": products.len(),
                })),
            );
            recommendations.push(Recommendation {
                label: label.clone(),
                products,
            });
        }

        let output_path = self.out_dir.join(OUTPUT_FILE_NAME);
        generated
            .save(&output_path)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        self.emit(
            "redesign_finished",
            map_object(json!({
                "output_path": output_path.to_string_lossy(),
                "cached": cached,
                "new_items": new_items.len(),
            })),
        );

        Ok(RedesignOutcome {
            output_path,
            prompt,
            seed,
            cached,
            new_items,
            recommendations,
        })
    }

    fn stage<T>(&self, stage: &str, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
        if let Err(err) = &result {
            self.emit(
                "redesign_failed",
                map_object(json!({
                    "stage": stage,
                    "error": err.to_string(),
                })),
            );
        }
        result
    }

    // Logging never aborts the pipeline step it decorates.
    fn emit(&self, event_type: &str, payload: EventPayload) {
        let _ = self.events.emit(event_type, payload);
    }
}

fn default_style_lexicon() -> IndexMap<&'static str, &'static str> {
    // First match wins, in this declared order.
    let mut lexicon = IndexMap::new();
    lexicon.insert("modern", "sleek, clean lines, minimalist");
    lexicon.insert("vintage", "nostalgic, retro furniture, soft shadows");
    lexicon.insert("warm lighting", "golden hour, cozy tones");
    lexicon.insert("cold lighting", "cool lighting, icy palette");
    lexicon
}

fn dominant_color(colors: &[DominantColor]) -> DominantColor {
    let mut ranked: Vec<&DominantColor> = colors.iter().collect();
    ranked.sort_by(|a, b| {
        b.pixel_fraction
            .partial_cmp(&a.pixel_fraction)
            .unwrap_or(Ordering::Equal)
    });
    ranked.first().map(|color| **color).unwrap_or(DominantColor {
        red: 0.0,
        green: 0.0,
        blue: 0.0,
        pixel_fraction: 0.0,
    })
}

fn draw_seed() -> u32 {
    rand::rng().random_range(0..SEED_SPAN)
}

pub fn snap_multiple(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    (value / multiple) * multiple
}

fn encode_jpeg_base64(image: &DynamicImage) -> Result<String, ProviderError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|err| ProviderError::Request {
            provider: VISION_PROVIDER,
            detail: format!("JPEG encode failed: {err}"),
        })?;
    Ok(BASE64.encode(&buffer))
}

fn first_annotate_response(payload: &Value) -> Result<&Value, ProviderError> {
    let body = || truncate_text(&payload.to_string(), 512);
    let rows = payload
        .get("responses")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MissingEnvelope {
            provider: VISION_PROVIDER,
            body: body(),
        })?;
    let first = rows.first().ok_or_else(|| ProviderError::EmptyEnvelope {
        provider: VISION_PROVIDER,
        body: body(),
    })?;
    if let Some(error) = first.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ProviderError::Remote {
            provider: VISION_PROVIDER,
            message,
        });
    }
    Ok(first)
}

fn parse_vision_analysis(response: &Value) -> VisionAnalysis {
    let objects = response
        .get("localizedObjectAnnotations")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let name = row.get("name").and_then(Value::as_str)?;
                    Some(DetectedObject {
                        name: name.to_string(),
                        score: row.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                        bounds: parse_points(
                            row.get("boundingPoly")
                                .and_then(|poly| poly.get("normalizedVertices")),
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let labels = response
        .get("labelAnnotations")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let description = row.get("description").and_then(Value::as_str)?;
                    if description.is_empty() {
                        return None;
                    }
                    Some(ImageLabel {
                        description: description.to_string(),
                        score: row.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let colors = response
        .get("imagePropertiesAnnotation")
        .and_then(|properties| properties.get("dominantColors"))
        .and_then(|dominant| dominant.get("colors"))
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    let channel = |key: &str| {
                        row.get("color")
                            .and_then(|color| color.get(key))
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0)
                    };
                    DominantColor {
                        red: channel("red"),
                        green: channel("green"),
                        blue: channel("blue"),
                        pixel_fraction: row
                            .get("pixelFraction")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    // The first text annotation is the full-page aggregate, not a token.
    let text = response
        .get("textAnnotations")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .skip(1)
                .filter_map(|row| {
                    let text = row.get("description").and_then(Value::as_str)?;
                    Some(TextFragment {
                        text: text.to_string(),
                        bounds: parse_points(
                            row.get("boundingPoly").and_then(|poly| poly.get("vertices")),
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    VisionAnalysis {
        objects,
        labels,
        colors,
        text,
    }
}

fn parse_points(value: Option<&Value>) -> Vec<Point> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| Point {
                    x: row.get("x").and_then(Value::as_f64).unwrap_or(0.0),
                    y: row.get("y").and_then(Value::as_f64).unwrap_or(0.0),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn assistant_reply_from_payload(payload: &Value) -> Result<String, ProviderError> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| ProviderError::MissingEnvelope {
            provider: ASSISTANT_PROVIDER,
            body: truncate_text(&payload.to_string(), 512),
        })
}

fn response_json_or_error(
    provider: &'static str,
    response: HttpResponse,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|source| ProviderError::Transport { provider, source })?;
    if !status.is_success() {
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|_| ProviderError::Payload {
        provider,
        detail: truncate_text(&body, 512),
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_from_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn format_bounds(points: &[Point]) -> String {
    let rendered: Vec<String> = points
        .iter()
        .map(|point| format!("({}, {})", trim_float(point.x), trim_float(point.y)))
        .collect();
    format!("[{}]", rendered.join(", "))
}

fn trim_float(value: f64) -> String {
    let mut text = format!("{value:.4}");
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    text
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str, seed: u32) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, seed: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
