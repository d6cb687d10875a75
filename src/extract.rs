use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::models::{ExtractionStatus, FailureKind, ImageKind, ProductRecord};

// ── Constants ────────────────────────────────────────────────────────────────

const MAX_REDIRECTS: usize = 10;
const PREFERRED_DESCRIPTOR: &str = "900w";
const PREFERRED_FORMAT: &str = "f=xl";

// ── Lazy static selectors ────────────────────────────────────────────────────

static MAIN_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"div[data-type="MAIN_PRODUCT_IMAGE"] img.pip-image"#).unwrap()
});

static MEASUREMENT_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"div[data-type="MEASUREMENT_ILLUSTRATION"] img.pip-image"#).unwrap()
});

static SRCSET_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("img[srcset]").unwrap());

static DIMENSION_ITEM_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        "ul.pip-product-dimensions__dimensions-container \
         li.pip-product-dimensions__measurement-wrapper",
    )
    .unwrap()
});

static DIMENSION_LABEL_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span.pip-product-dimensions__measurement-name").unwrap());

static DETAILS_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.pip-product-details__container").unwrap());

static DETAILS_HEADER_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("h3, h4").unwrap());

static JSONLD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());

// ── Lazy static regexes ──────────────────────────────────────────────────────

static DESCRIPTOR_WIDTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

static MATERIAL_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)material").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("URL did not return HTML")]
    NotHtml,
    #[error("Page is larger than {0} bytes")]
    TooLarge(usize),
    #[error("Upstream returned {0}")]
    Upstream(reqwest::StatusCode),
    #[error("{0}")]
    Request(String),
    #[error("Page did not contain any recognizable product sections")]
    Unrecognized,
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::Unrecognized => FailureKind::Parse,
            _ => FailureKind::Fetch,
        }
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// Fetches product pages and turns them into [`ProductRecord`]s.
///
/// Holds a single `reqwest::Client`, so one instance can serve any number of
/// concurrent extractions.
pub struct Extractor {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl Extractor {
    pub fn new(config: &Config) -> Result<Self, ExtractionError> {
        let client = client_builder(config)
            .build()
            .map_err(|e| ExtractionError::Request(e.to_string()))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    #[cfg(test)]
    pub(crate) fn without_proxy(config: &Config) -> Self {
        let client = client_builder(config).no_proxy().build().unwrap();
        Self {
            client,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Never fails: fetch and parse errors end up in the record's `status`.
    pub async fn extract(&self, url: &str) -> ProductRecord {
        match self.try_extract(url).await {
            Ok(record) => {
                info!(
                    url,
                    status = ?record.status,
                    images = record.images.len(),
                    measurements = record.measurements.len(),
                    has_materials = !record.materials.is_empty(),
                    "extracted product page"
                );
                record
            }
            Err(e) => {
                warn!(url, kind = ?e.kind(), error = %e, "extraction failed");
                ProductRecord::failed(url, e.kind(), e.to_string())
            }
        }
    }

    async fn try_extract(&self, url: &str) -> Result<ProductRecord, ExtractionError> {
        let parsed = validate_url(url)?;
        let html = self.fetch_html(parsed).await?;
        parse_product_page(&html, url)
    }

    // ── HTTP fetch ───────────────────────────────────────────────────────────

    async fn fetch_html(&self, url: Url) -> Result<String, ExtractionError> {
        debug!(%url, "fetching page");

        let mut response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Request(format!("TimeoutError: {}", e))
            } else if e.is_connect() {
                ExtractionError::Request(format!("ConnectError: {}", e))
            } else {
                ExtractionError::Request(format!("RequestError: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Upstream(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        if !content_type.contains("html") {
            return Err(ExtractionError::NotHtml);
        }

        let limit = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(ExtractionError::TooLarge(limit));
        }

        // Content-Length can be missing or wrong.
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Request(format!("TimeoutError: {}", e))
            } else {
                ExtractionError::Request(e.to_string())
            }
        })? {
            if body.len() + chunk.len() > limit {
                return Err(ExtractionError::TooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn client_builder(config: &Config) -> reqwest::ClientBuilder {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(config.user_agent.as_str())
        .default_headers(headers);

    if config.insecure_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
}

// ── URL validation ───────────────────────────────────────────────────────────

pub fn validate_url(url: &str) -> Result<Url, ExtractionError> {
    let parsed = Url::parse(url.trim())
        .map_err(|_| ExtractionError::InvalidUrl("Invalid URL".to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(ExtractionError::InvalidUrl("URL has no host".to_string())),
        _ => Err(ExtractionError::InvalidUrl(
            "Only http and https URLs are allowed".to_string(),
        )),
    }
}

// ── Page parsing ─────────────────────────────────────────────────────────────

/// Parse product page markup into a record. Missing sections leave their
/// field empty; a page with none of them is [`ExtractionError::Unrecognized`].
pub fn parse_product_page(html: &str, source_url: &str) -> Result<ProductRecord, ExtractionError> {
    let document = Html::parse_document(html);
    let base = Url::parse(source_url).ok();

    let mut images = extract_images(&document, base.as_ref());
    let measurements = extract_measurements(&document);
    let materials = extract_materials(&document).unwrap_or_default();

    // Metadata images only fill in for a page recognized by its product sections.
    if images.is_empty() && (!measurements.is_empty() || !materials.is_empty()) {
        if let Some(url) = extract_metadata_image(&document, base.as_ref()) {
            debug!(%url, "using page metadata image");
            images.push(url);
        }
    }

    let found = [
        !images.is_empty(),
        !measurements.is_empty(),
        !materials.is_empty(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();

    let status = match found {
        0 => return Err(ExtractionError::Unrecognized),
        3 => ExtractionStatus::Ok,
        _ => ExtractionStatus::Partial,
    };

    Ok(ProductRecord {
        source_url: source_url.to_string(),
        images,
        measurements,
        materials,
        status,
        error: None,
    })
}

// ── Images ───────────────────────────────────────────────────────────────────

fn extract_images(document: &Html, base: Option<&Url>) -> Vec<String> {
    let mut found: Vec<(ImageKind, String)> = Vec::new();

    for (selector, kind) in [
        (&*MAIN_IMAGE_SEL, ImageKind::Main),
        (&*MEASUREMENT_IMAGE_SEL, ImageKind::Measurement),
    ] {
        let url = document
            .select(selector)
            .next()
            .and_then(|img| img.value().attr("srcset"))
            .and_then(pick_srcset_url);
        if let Some(url) = url {
            found.push((kind, url));
        }
    }

    if found.is_empty() {
        debug!("no gallery images, falling back to every srcset image");
        found = document
            .select(&SRCSET_IMAGE_SEL)
            .filter_map(|img| {
                let url = img.value().attr("srcset").and_then(pick_srcset_url)?;
                Some((classify_image(img), url))
            })
            .collect();
    }

    // Stable: document order is kept within each kind.
    found.sort_by_key(|(kind, _)| *kind);

    let mut images: Vec<String> = Vec::new();
    for (_, raw) in found {
        if let Some(url) = resolve_url(base, &raw) {
            if !images.contains(&url) {
                images.push(url);
            }
        }
    }

    images
}

fn extract_metadata_image(document: &Html, base: Option<&Url>) -> Option<String> {
    extract_meta_image(document)
        .or_else(|| extract_jsonld_image(document))
        .and_then(|raw| resolve_url(base, &raw))
}

/// Guess an image's role from the markup two levels above it.
fn classify_image(img: ElementRef<'_>) -> ImageKind {
    let context = img
        .parent()
        .and_then(|p| p.parent())
        .and_then(ElementRef::wrap)
        .map(|el| el.html().to_lowercase())
        .unwrap_or_default();

    if context.contains("main") {
        ImageKind::Main
    } else if context.contains("measurement") {
        ImageKind::Measurement
    } else {
        ImageKind::Unknown
    }
}

fn resolve_url(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let resolved = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    };
    resolved.ok().map(|u| u.to_string())
}

// ── srcset handling ──────────────────────────────────────────────────────────

struct SrcsetCandidate<'a> {
    url: &'a str,
    descriptor: &'a str,
    width: u32,
}

fn parse_srcset(srcset: &str) -> Vec<SrcsetCandidate<'_>> {
    srcset
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split_whitespace();
            let url = pieces.next()?;
            let descriptor = pieces.next().unwrap_or("");
            let width = DESCRIPTOR_WIDTH_RE
                .find(descriptor)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            Some(SrcsetCandidate {
                url,
                descriptor,
                width,
            })
        })
        .collect()
}

/// Prefer the `f=xl` rendition at 900w, then any 900w, then the widest.
fn pick_srcset_url(srcset: &str) -> Option<String> {
    let candidates = parse_srcset(srcset);

    candidates
        .iter()
        .find(|c| c.url.contains(PREFERRED_FORMAT) && c.descriptor == PREFERRED_DESCRIPTOR)
        .or_else(|| candidates.iter().find(|c| c.descriptor == PREFERRED_DESCRIPTOR))
        // rev() so the first of several equally wide candidates wins
        .or_else(|| candidates.iter().rev().max_by_key(|c| c.width))
        .map(|c| c.url.to_string())
}

// ── Metadata image fallbacks ─────────────────────────────────────────────────

fn extract_meta_image(document: &Html) -> Option<String> {
    let checks = [
        ("property", "og:image"),
        ("property", "og:image:secure_url"),
        ("name", "twitter:image"),
        ("name", "twitter:image:src"),
    ];
    for (attr, value) in &checks {
        let sel_str = format!("meta[{}=\"{}\"]", attr, value);
        // Use .ok() immediately to drop SelectorErrorKind<'_> before sel_str is dropped.
        let Some(sel) = Selector::parse(&sel_str).ok() else {
            continue;
        };
        let content = document
            .select(&sel)
            .find_map(|el| el.value().attr("content"))
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if let Some(content) = content {
            return Some(content.to_string());
        }
    }
    None
}

fn extract_jsonld_image(document: &Html) -> Option<String> {
    document.select(&JSONLD_SEL).find_map(|script| {
        let text: String = script.text().collect();
        serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| jsonld_image_value(&value))
    })
}

fn jsonld_image_value(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get("image")
            .and_then(image_entry_url)
            .or_else(|| map.values().find_map(jsonld_image_value)),
        Value::Array(arr) => arr.iter().find_map(jsonld_image_value),
        _ => None,
    }
}

/// `image` may be a string, an `ImageObject`, or a list of either.
fn image_entry_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => match obj.get("url") {
            Some(Value::String(u)) => Some(u.clone()),
            _ => None,
        },
        Value::Array(arr) => arr.iter().find_map(image_entry_url),
        _ => None,
    }
}

// ── Measurements ─────────────────────────────────────────────────────────────

fn extract_measurements(document: &Html) -> Vec<String> {
    document
        .select(&DIMENSION_ITEM_SEL)
        .filter_map(|item| {
            let full = normalize_text(&collect_text(item));
            let fragment = match item.select(&DIMENSION_LABEL_SEL).next() {
                Some(label_el) => {
                    let raw_label = normalize_text(&collect_text(label_el));
                    let label = raw_label.replace(':', "").trim().to_string();
                    let value = full.replacen(&raw_label, "", 1).trim().to_string();
                    match (label.is_empty(), value.is_empty()) {
                        (_, true) => String::new(),
                        (true, false) => value,
                        (false, false) => format!("{}: {}", label, value),
                    }
                }
                None => full,
            };
            (!fragment.is_empty()).then_some(fragment)
        })
        .collect()
}

// ── Materials ────────────────────────────────────────────────────────────────

fn extract_materials(document: &Html) -> Option<String> {
    let container = document.select(&DETAILS_SEL).next()?;

    for header in container.select(&DETAILS_HEADER_SEL) {
        if !MATERIAL_HEADER_RE.is_match(&collect_text(header)) {
            continue;
        }

        let mut parts = Vec::new();
        for sibling in header.next_siblings().filter_map(ElementRef::wrap) {
            match sibling.value().name() {
                "h3" | "h4" => break,
                "p" => {
                    let text = normalize_text(&collect_text(sibling));
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
                _ => {}
            }
        }

        if !parts.is_empty() {
            return Some(parts.join(" "));
        }
    }
    None
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

fn collect_text(el: ElementRef<'_>) -> String {
    el.text().collect()
}

/// Collapse runs of whitespace into single spaces and trim.
fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
