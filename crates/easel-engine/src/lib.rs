use std::env;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use easel_contracts::{
    AssetRecord, CompletionStatus, ExtendImageRequest, ExtensionOutcome, ExtensionPolicy,
    OcrResult, Rect, TextRegion, UploadMetadata,
};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect as PixelRect;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

const DOWNLOAD_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const BACKEND_TIMEOUT_SECS: u64 = 180;

const ANALYSER_INSTRUCTION: &str = "\
Describe the background artwork of the given image in one paragraph: the \
scenery, colors, lighting and style. Ignore any text, titles or typography on \
the image. The paragraph will be used directly as a prompt to generate more of \
the same background. Respond with a JSON object of the form \
{\"background_prompt\": \"...\"}.";

#[derive(Debug, Clone)]
pub struct BackgroundPrompt {
    pub background_prompt: String,
}

/// Generation backend; takes URL references, may return mismatched dimensions.
pub trait InpaintBackend: Send + Sync {
    fn name(&self) -> &str;
    fn inpaint(&self, prompt: &str, image_url: &str, mask_url: &str) -> Result<String>;
    fn remove_object(&self, image_url: &str, mask_url: &str) -> Result<String>;
}

/// Describes an image's background for use as the inpainting prompt.
pub trait BackgroundAnalyser: Send + Sync {
    fn describe_background(&self, image_url: &str) -> Result<BackgroundPrompt>;
}

/// OCR collaborator returning polygon text regions.
pub trait TextDetector: Send + Sync {
    fn detect_text(&self, image_url: &str) -> Result<OcrResult>;
}

/// Storage seam; generation backends need URL references, not raw bytes.
pub trait ObjectStorage: Send + Sync {
    fn put_temp(&self, bytes: &[u8], suffix: &str) -> Result<String>;
    fn put_object(
        &self,
        bytes: &[u8],
        object_name: &str,
        metadata: &UploadMetadata,
    ) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct DiskStorage {
    media_root: PathBuf,
    public_base_url: Option<String>,
}

impl DiskStorage {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            public_base_url: non_empty_env("EASEL_PUBLIC_BASE_URL"),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.public_base_url = base_url.filter(|value| !value.trim().is_empty());
        self
    }

    fn write_object(&self, object_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.media_root.join(object_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }

    fn url_for(&self, object_name: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), object_name),
            None => format!("file://{}", self.media_root.join(object_name).display()),
        }
    }
}

impl ObjectStorage for DiskStorage {
    fn put_temp(&self, bytes: &[u8], suffix: &str) -> Result<String> {
        let digest = Sha256::digest(bytes);
        let object_name = format!("tmp/{digest:x}{suffix}");
        self.write_object(&object_name, bytes)?;
        Ok(self.url_for(&object_name))
    }

    fn put_object(
        &self,
        bytes: &[u8],
        object_name: &str,
        metadata: &UploadMetadata,
    ) -> Result<String> {
        self.write_object(object_name, bytes)?;
        let sidecar = format!("{object_name}.json");
        self.write_object(&sidecar, &serde_json::to_vec_pretty(metadata)?)?;
        Ok(self.url_for(object_name))
    }
}

#[derive(Debug, Clone)]
pub struct ImageFetcher {
    http: HttpClient,
}

impl ImageFetcher {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .context("failed building download client")?;
        Ok(Self { http })
    }

    pub fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return fs::read(path).with_context(|| format!("failed reading {path}"));
        }
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec())
    }
}

pub struct ReplicateBackend {
    api_base: String,
    http: HttpClient,
    inpaint_model: String,
    remove_model: String,
    ocr_model: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl ReplicateBackend {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(BACKEND_TIMEOUT_SECS))
            .build()
            .context("failed building Replicate client")?;
        Ok(Self {
            api_base: non_empty_env("REPLICATE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            http,
            inpaint_model: non_empty_env("EASEL_INPAINT_MODEL")
                .unwrap_or_else(|| "ideogram-ai/ideogram-v3-turbo".to_string()),
            remove_model: non_empty_env("EASEL_REMOVE_MODEL").unwrap_or_else(|| {
                "zylim0702/remove-object:0e3a841c913f597c1e4c321560aa69e2bc1f15c65f8c366caafc379240efd8ba"
                    .to_string()
            }),
            ocr_model: non_empty_env("EASEL_OCR_MODEL").unwrap_or_else(|| {
                "lucataco/florence-2-large:da53547e17d45b9cfb48174b2f18af8b83ca020fa76db62136bf9c6616762595"
                    .to_string()
            }),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(BACKEND_TIMEOUT_SECS),
        })
    }

    fn api_key() -> Result<String> {
        non_empty_env("REPLICATE_API_TOKEN")
            .or_else(|| non_empty_env("REPLICATE_API_KEY"))
            .context("REPLICATE_API_TOKEN not set")
    }

    fn run_prediction(&self, model: &str, input: Value) -> Result<Value> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/predictions", self.api_base);

        // Pinned models are addressed by version, latest-tagged ones by model.
        let payload = match model.split_once(':') {
            Some((_, version)) => json!({ "version": version, "input": input }),
            None => json!({ "model": model, "input": input }),
        };

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Prefer", "wait")
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("Replicate", response)?;

        let status = prediction_status(&prediction);
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .context("Replicate prediction missing poll URL")?
                    .to_string();
                prediction = self.poll_prediction(&poll_url, &api_key)?;
            } else {
                bail!("Replicate prediction failed: {prediction}");
            }
        }
        Ok(prediction)
    }

    fn poll_prediction(&self, poll_url: &str, api_key: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!("Replicate prediction failed: {payload}"),
                _ => {}
            }
            if started.elapsed() >= self.poll_timeout {
                bail!(
                    "Replicate polling timed out after {:.0}s",
                    self.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn first_output_url(prediction: &Value) -> Result<String> {
        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_output_urls(output, &mut urls);
        }
        urls.into_iter()
            .next()
            .context("Replicate response returned no image URLs")
    }
}

impl InpaintBackend for ReplicateBackend {
    fn name(&self) -> &str {
        "replicate"
    }

    fn inpaint(&self, prompt: &str, image_url: &str, mask_url: &str) -> Result<String> {
        let prediction = self.run_prediction(
            &self.inpaint_model,
            json!({
                "prompt": prompt,
                "image": image_url,
                "mask": mask_url,
            }),
        )?;
        Self::first_output_url(&prediction)
    }

    fn remove_object(&self, image_url: &str, mask_url: &str) -> Result<String> {
        let prediction = self.run_prediction(
            &self.remove_model,
            json!({
                "image": image_url,
                "mask": mask_url,
            }),
        )?;
        Self::first_output_url(&prediction)
    }
}

impl TextDetector for ReplicateBackend {
    fn detect_text(&self, image_url: &str) -> Result<OcrResult> {
        let prediction = self.run_prediction(
            &self.ocr_model,
            json!({
                "image": image_url,
                "task_input": "OCR with Region",
            }),
        )?;
        let output = prediction
            .get("output")
            .context("Replicate OCR response missing output")?;
        OcrResult::from_florence_payload(output)
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

pub struct HttpBackgroundAnalyser {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl HttpBackgroundAnalyser {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(BACKEND_TIMEOUT_SECS))
            .build()
            .context("failed building analyser client")?;
        Ok(Self {
            api_base: non_empty_env("EASEL_ANALYSER_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            api_key: non_empty_env("EASEL_ANALYSER_API_KEY")
                .or_else(|| non_empty_env("OPENAI_API_KEY")),
            model: non_empty_env("EASEL_ANALYSER_MODEL")
                .unwrap_or_else(|| "google/gemini-flash-1.5".to_string()),
            http,
        })
    }

    fn image_reference(&self, image_url: &str) -> Result<String> {
        let Some(path) = image_url.strip_prefix("file://") else {
            return Ok(image_url.to_string());
        };
        let bytes = fs::read(path).with_context(|| format!("failed reading {path}"))?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
    }
}

impl BackgroundAnalyser for HttpBackgroundAnalyser {
    fn describe_background(&self, image_url: &str) -> Result<BackgroundPrompt> {
        let api_key = self
            .api_key
            .clone()
            .context("EASEL_ANALYSER_API_KEY not set")?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": ANALYSER_INSTRUCTION },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": "Analyse this image and give a detailed description of the background."
                        },
                        {
                            "type": "image_url",
                            "image_url": { "url": self.image_reference(image_url)? }
                        }
                    ]
                }
            ],
            "response_format": { "type": "json_object" },
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("background analysis request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Background analyser", response)?;
        let content = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .context("background analyser returned no content")?;

        let background_prompt = serde_json::from_str::<Value>(content)
            .ok()
            .and_then(|value| {
                value
                    .get("background_prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| content.trim().to_string());
        if background_prompt.is_empty() {
            bail!("background analyser returned an empty description");
        }
        Ok(BackgroundPrompt { background_prompt })
    }
}

pub struct DryrunBackend {
    storage: DiskStorage,
    fetcher: ImageFetcher,
}

impl DryrunBackend {
    pub fn new(storage: DiskStorage) -> Result<Self> {
        Ok(Self {
            storage,
            fetcher: ImageFetcher::new()?,
        })
    }

    fn fill_masked(&self, image_url: &str, mask_url: &str) -> Result<String> {
        let image_bytes = self.fetcher.fetch(image_url)?;
        let mask_bytes = self.fetcher.fetch(mask_url)?;
        let mut image = image::load_from_memory(&image_bytes)
            .context("dryrun failed decoding context image")?
            .to_rgba8();
        let mask = image::load_from_memory(&mask_bytes)
            .context("dryrun failed decoding mask")?
            .to_luma8();

        let fill = average_opaque_color(&image);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let covered = mask
                .get_pixel_checked(x, y)
                .map(|value| value[0] >= 128)
                .unwrap_or(false);
            if covered || pixel[3] == 0 {
                *pixel = fill;
            }
        }

        self.storage.put_temp(&encode_png(&image)?, ".png")
    }
}

impl InpaintBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn inpaint(&self, _prompt: &str, image_url: &str, mask_url: &str) -> Result<String> {
        self.fill_masked(image_url, mask_url)
    }

    fn remove_object(&self, image_url: &str, mask_url: &str) -> Result<String> {
        self.fill_masked(image_url, mask_url)
    }
}

pub struct DryrunAnalyser;

impl BackgroundAnalyser for DryrunAnalyser {
    fn describe_background(&self, _image_url: &str) -> Result<BackgroundPrompt> {
        Ok(BackgroundPrompt {
            background_prompt: "extend background".to_string(),
        })
    }
}

pub struct DryrunDetector;

impl TextDetector for DryrunDetector {
    fn detect_text(&self, _image_url: &str) -> Result<OcrResult> {
        Ok(OcrResult::default())
    }
}

#[derive(Debug, Clone)]
pub struct TextPatch {
    pub pixels: RgbaImage,
    pub origin: Rect,
}

pub fn place_source(canvas: &mut RgbaImage, source: &RgbaImage, rect: Rect) {
    imageops::overlay(canvas, source, i64::from(rect.x1), i64::from(rect.y1));
}

pub fn compose_tile(canvas: &mut RgbaImage, tile: RgbaImage, rect: Rect) {
    let tile = if tile.dimensions() != (rect.width(), rect.height()) {
        warn!(
            tile_width = tile.width(),
            tile_height = tile.height(),
            expected_width = rect.width(),
            expected_height = rect.height(),
            "generated tile dimensions mismatch; resizing"
        );
        imageops::resize(&tile, rect.width(), rect.height(), FilterType::Lanczos3)
    } else {
        tile
    };
    imageops::overlay(canvas, &tile, i64::from(rect.x1), i64::from(rect.y1));
}

pub fn crop_rect(canvas: &RgbaImage, rect: Rect) -> RgbaImage {
    imageops::crop_imm(canvas, rect.x1, rect.y1, rect.width(), rect.height()).to_image()
}

pub fn build_step_mask(
    previous: Rect,
    expansion: Rect,
    policy: &ExtensionPolicy,
    invert_text: bool,
) -> GrayImage {
    let (fill, preserve) = if invert_text {
        (0u8, 255u8)
    } else {
        (255u8, 0u8)
    };
    let mut mask = GrayImage::from_pixel(expansion.width(), expansion.height(), Luma([fill]));

    let grew_left = expansion.x1 < previous.x1;
    let grew_right = expansion.x2 > previous.x2;
    let grew_top = expansion.y1 < previous.y1;
    let grew_bottom = expansion.y2 > previous.y2;

    let overlap_x = i64::from(policy.overlap_for(previous.width()));
    let overlap_y = i64::from(policy.overlap_for(previous.height()));

    let left = i64::from(previous.x1 - expansion.x1) + if grew_left { overlap_x } else { 0 };
    let top = i64::from(previous.y1 - expansion.y1) + if grew_top { overlap_y } else { 0 };
    let right = i64::from(previous.x2 - expansion.x1) - if grew_right { overlap_x } else { 0 };
    let bottom = i64::from(previous.y2 - expansion.y1) - if grew_bottom { overlap_y } else { 0 };

    if left < right && top < bottom {
        // Corner-inclusive: the preserved area keeps its right/bottom edge.
        draw_filled_rect_mut(
            &mut mask,
            PixelRect::at(left as i32, top as i32)
                .of_size((right - left + 1) as u32, (bottom - top + 1) as u32),
            Luma([preserve]),
        );
    }
    mask
}

pub fn average_color(image: &DynamicImage) -> Rgba<u8> {
    match image {
        DynamicImage::ImageLuma8(gray) => {
            let pixel = imageops::resize(gray, 1, 1, FilterType::Lanczos3);
            let value = pixel.get_pixel(0, 0)[0];
            Rgba([value, value, value, 255])
        }
        DynamicImage::ImageRgb8(rgb) => {
            let pixel = imageops::resize(rgb, 1, 1, FilterType::Lanczos3);
            let [r, g, b] = pixel.get_pixel(0, 0).0;
            Rgba([r, g, b, 255])
        }
        other => {
            let rgba = other.to_rgba8();
            let pixel = imageops::resize(&rgba, 1, 1, FilterType::Lanczos3);
            *pixel.get_pixel(0, 0)
        }
    }
}

fn average_opaque_color(image: &RgbaImage) -> Rgba<u8> {
    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for pixel in image.pixels() {
        if pixel[3] > 0 {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += u64::from(channel);
            }
            count += 1;
        }
    }
    if count == 0 {
        return Rgba([0, 0, 0, 255]);
    }
    Rgba([
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
        255,
    ])
}

fn region_polygon(region: &TextRegion) -> Vec<Point<i32>> {
    let mut points: Vec<Point<i32>> = Vec::new();
    for (x, y) in region.polygon_points() {
        let point = Point::new(x, y);
        if points.last() != Some(&point) {
            points.push(point);
        }
    }
    // draw_polygon_mut rejects a closing point equal to the first.
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

fn draw_region<P>(
    canvas: &mut image::ImageBuffer<P, Vec<P::Subpixel>>,
    region: &TextRegion,
    color: P,
) where
    P: image::Pixel + 'static,
{
    let points = region_polygon(region);
    if points.len() >= 3 {
        draw_polygon_mut(canvas, &points, color);
        return;
    }
    let bbox = region.axis_aligned_box();
    if bbox.width() > 0 && bbox.height() > 0 {
        draw_filled_rect_mut(
            canvas,
            PixelRect::at(bbox.x1 as i32, bbox.y1 as i32).of_size(bbox.width(), bbox.height()),
            color,
        );
    }
}

pub fn save_text_patches(image: &RgbaImage, regions: &[TextRegion]) -> Vec<TextPatch> {
    let (width, height) = image.dimensions();
    let mut patches = Vec::new();

    for region in regions {
        let bbox = region.axis_aligned_box();
        let bbox = Rect::new(
            bbox.x1.min(width),
            bbox.y1.min(height),
            bbox.x2.min(width),
            bbox.y2.min(height),
        );
        if bbox.width() == 0 || bbox.height() == 0 {
            continue;
        }

        let mut mask = GrayImage::from_pixel(width, height, Luma([0]));
        draw_region(&mut mask, region, Luma([255]));
        let mask_crop =
            imageops::crop_imm(&mask, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image();
        let source_crop = crop_rect(image, bbox);

        let mut pixels = RgbaImage::from_pixel(bbox.width(), bbox.height(), Rgba([0, 0, 0, 0]));
        for (x, y, pixel) in pixels.enumerate_pixels_mut() {
            if mask_crop.get_pixel(x, y)[0] >= 128 {
                *pixel = *source_crop.get_pixel(x, y);
            }
        }
        patches.push(TextPatch {
            pixels,
            origin: bbox,
        });
    }
    patches
}

pub fn combined_region_mask(width: u32, height: u32, regions: &[TextRegion]) -> GrayImage {
    let mut mask = GrayImage::from_pixel(width, height, Luma([0]));
    for region in regions {
        draw_region(&mut mask, region, Luma([255]));
    }
    mask
}

pub fn paint_regions(image: &mut RgbaImage, regions: &[TextRegion], color: Rgba<u8>) {
    for region in regions {
        draw_region(image, region, color);
    }
}

pub fn restore_patches(
    canvas: &mut RgbaImage,
    patches: &[TextPatch],
    scale_x: f64,
    scale_y: f64,
    origin: (u32, u32),
) {
    for patch in patches {
        let new_width = (f64::from(patch.pixels.width()) * scale_x) as u32;
        let new_height = (f64::from(patch.pixels.height()) * scale_y) as u32;
        if new_width == 0 || new_height == 0 {
            continue;
        }
        let resized = if (new_width, new_height) == patch.pixels.dimensions() {
            patch.pixels.clone()
        } else {
            imageops::resize(&patch.pixels, new_width, new_height, FilterType::Lanczos3)
        };
        let paste_x = i64::from(origin.0) + (f64::from(patch.origin.x1) * scale_x) as i64;
        let paste_y = i64::from(origin.1) + (f64::from(patch.origin.y1) * scale_y) as i64;
        imageops::overlay(canvas, &resized, paste_x, paste_y);
    }
}

pub fn encode_png<P>(image: &image::ImageBuffer<P, Vec<P::Subpixel>>) -> Result<Vec<u8>>
where
    P: image::PixelWithColorType,
    [P::Subpixel]: image::EncodableLayout,
{
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .context("failed encoding PNG")?;
    Ok(buffer)
}

pub struct ExtendImageEngine {
    inpaint: Box<dyn InpaintBackend>,
    analyser: Box<dyn BackgroundAnalyser>,
    detector: Box<dyn TextDetector>,
    storage: Box<dyn ObjectStorage>,
    fetcher: ImageFetcher,
    policy: ExtensionPolicy,
}

impl ExtendImageEngine {
    pub fn new(
        inpaint: Box<dyn InpaintBackend>,
        analyser: Box<dyn BackgroundAnalyser>,
        detector: Box<dyn TextDetector>,
        storage: Box<dyn ObjectStorage>,
        fetcher: ImageFetcher,
    ) -> Self {
        Self {
            inpaint,
            analyser,
            detector,
            storage,
            fetcher,
            policy: ExtensionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExtensionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn extend_image(
        &self,
        request: &ExtendImageRequest,
        file_bytes: &[u8],
        user_id: &str,
    ) -> Result<ExtensionOutcome> {
        request.validate()?;
        info!(
            target_width = request.target_width,
            target_height = request.target_height,
            remove_text = request.remove_text,
            backend = self.inpaint.name(),
            "starting image extension"
        );

        let decoded =
            image::load_from_memory(file_bytes).context("failed decoding source image")?;
        let mut working = decoded.to_rgba8();
        let original_size = working.dimensions();

        let analysis_url = self
            .storage
            .put_temp(&encode_png(&working)?, ".png")
            .context("failed uploading source image")?;
        let prompt = self
            .analyser
            .describe_background(&analysis_url)
            .context("background analysis failed")?;

        let original_with_text = working.clone();
        let mut saved_patches = Vec::new();
        if request.remove_text {
            let regions = match self.detector.detect_text(&analysis_url) {
                Ok(result) => {
                    info!(count = result.regions.len(), "detected text regions");
                    result.regions
                }
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "text detection failed; continuing without regions"
                    );
                    Vec::new()
                }
            };
            if !regions.is_empty() {
                saved_patches = save_text_patches(&original_with_text, &regions);
                match self.remove_text_regions(&working, &regions) {
                    Ok(cleaned) => working = cleaned,
                    Err(err) => {
                        warn!(
                            error = %format!("{err:#}"),
                            "text removal failed; falling back to average color fill"
                        );
                        let color = average_color(&DynamicImage::ImageRgba8(working.clone()));
                        paint_regions(&mut working, &regions, color);
                    }
                }
            }
        }

        let rect = request.original_box.to_rect();
        let resized_source =
            imageops::resize(&working, rect.width(), rect.height(), FilterType::Lanczos3);
        let mut canvas = RgbaImage::from_pixel(
            request.target_width,
            request.target_height,
            Rgba([0, 0, 0, 0]),
        );
        place_source(&mut canvas, &resized_source, rect);

        let scale_x = f64::from(rect.width()) / f64::from(original_size.0);
        let scale_y = f64::from(rect.height()) / f64::from(original_size.1);

        if rect.covers_target(request.target_width, request.target_height) {
            info!("placed source already covers the target; skipping extension loop");
            if !saved_patches.is_empty() {
                restore_patches(
                    &mut canvas,
                    &saved_patches,
                    scale_x,
                    scale_y,
                    (rect.x1, rect.y1),
                );
            }
            return self.finalize(canvas, user_id, CompletionStatus::AlreadyCovered, 0, rect);
        }

        let max_area = self.policy.max_extension_area(rect.area());
        let mut current = rect;
        let mut iterations = 0u32;
        let mut interrupted = false;

        info!(
            max_iterations = self.policy.max_iterations,
            max_extension_area = max_area,
            "starting extension loop"
        );

        while !current.covers_target(request.target_width, request.target_height)
            && iterations < self.policy.max_iterations
        {
            iterations += 1;
            let expansion = current.expand_bounded(
                request.target_width,
                request.target_height,
                max_area,
                self.policy.expansion_step,
            );
            if expansion == current {
                warn!(iteration = iterations, "expansion stalled; exiting loop");
                interrupted = true;
                break;
            }

            let mask = build_step_mask(current, expansion, &self.policy, request.invert_text);
            let context = crop_rect(&canvas, expansion);

            match self.run_inpaint_step(&prompt.background_prompt, &mask, &context) {
                Ok(tile) => {
                    compose_tile(&mut canvas, tile, expansion);
                    current = expansion;
                    info!(iteration = iterations, current = ?current, "iteration complete");
                }
                Err(err) => {
                    warn!(
                        iteration = iterations,
                        error = %format!("{err:#}"),
                        "inpainting step failed; keeping partial canvas"
                    );
                    interrupted = true;
                    break;
                }
            }
        }

        let status = if current.covers_target(request.target_width, request.target_height) {
            info!(iterations, "extended image to target dimensions");
            CompletionStatus::Complete
        } else if interrupted {
            warn!(iterations, "extension ended early; returning partial result");
            CompletionStatus::Stalled
        } else {
            warn!(iterations, "iteration cap reached before full coverage");
            CompletionStatus::IterationCapped
        };

        if !saved_patches.is_empty() {
            info!(count = saved_patches.len(), "restoring text patches");
            restore_patches(
                &mut canvas,
                &saved_patches,
                scale_x,
                scale_y,
                (rect.x1, rect.y1),
            );
        }

        self.finalize(canvas, user_id, status, iterations, current)
    }

    fn remove_text_regions(&self, image: &RgbaImage, regions: &[TextRegion]) -> Result<RgbaImage> {
        let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
        let image_url = self.storage.put_temp(&encode_png(&rgb)?, ".png")?;
        let mask = combined_region_mask(image.width(), image.height(), regions);
        let mask_url = self.storage.put_temp(&encode_png(&mask)?, ".png")?;

        let result_url = self.inpaint.remove_object(&image_url, &mask_url)?;
        let bytes = self.fetcher.fetch(&result_url)?;
        let cleaned = image::load_from_memory(&bytes)
            .context("failed decoding text-removal result")?
            .to_rgba8();
        info!("removed text using the inpainting backend");
        Ok(cleaned)
    }

    fn run_inpaint_step(
        &self,
        prompt: &str,
        mask: &GrayImage,
        context: &RgbaImage,
    ) -> Result<RgbaImage> {
        let mask_url = self.storage.put_temp(&encode_png(mask)?, ".png")?;
        let image_url = self.storage.put_temp(&encode_png(context)?, ".png")?;
        let result_url = self.inpaint.inpaint(prompt, &image_url, &mask_url)?;
        let bytes = self.fetcher.fetch(&result_url)?;
        Ok(image::load_from_memory(&bytes)
            .context("failed decoding inpainted tile")?
            .to_rgba8())
    }

    fn finalize(
        &self,
        canvas: RgbaImage,
        user_id: &str,
        status: CompletionStatus,
        iterations: u32,
        coverage: Rect,
    ) -> Result<ExtensionOutcome> {
        let id = Uuid::new_v4();
        let object_name = format!("users/{user_id}/extended_image/{id}");
        let metadata = UploadMetadata {
            artwork_type: "extended_image".to_string(),
            user_id: user_id.to_string(),
            artwork_status: "final".to_string(),
            artwork_width: canvas.width().to_string(),
            artwork_height: canvas.height().to_string(),
        };
        let image_url = self
            .storage
            .put_object(&encode_png(&canvas)?, &object_name, &metadata)
            .context("failed uploading final image")?;

        info!(status = ?status, iterations, image_url = %image_url, "image extension finished");
        Ok(ExtensionOutcome {
            asset: AssetRecord {
                id,
                image_url,
                created_at: Utc::now(),
            },
            status,
            iterations,
            coverage,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use easel_contracts::{
        BoxSpec, CompletionStatus, ExtendImageRequest, ExtensionPolicy, OcrResult, Rect,
        TextRegion,
    };
    use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};

    use super::{
        average_color, build_step_mask, combined_region_mask, compose_tile, crop_rect, encode_png,
        paint_regions, place_source, restore_patches, save_text_patches, BackgroundAnalyser,
        BackgroundPrompt, DiskStorage, DryrunBackend, DryrunDetector, ExtendImageEngine,
        ImageFetcher, InpaintBackend, ObjectStorage, TextDetector,
    };

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(color))
    }

    fn rect_region(x1: f32, y1: f32, x2: f32, y2: f32) -> TextRegion {
        TextRegion {
            text: "text".to_string(),
            bounding_box: vec![x1, y1, x2, y1, x2, y2, x1, y2],
        }
    }

    struct FailingBackend {
        calls: Arc<AtomicUsize>,
    }

    impl InpaintBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn inpaint(
            &self,
            _prompt: &str,
            _image_url: &str,
            _mask_url: &str,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("backend unavailable")
        }

        fn remove_object(&self, _image_url: &str, _mask_url: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("backend unavailable")
        }
    }

    struct FixedDetector {
        regions: Vec<TextRegion>,
    }

    impl TextDetector for FixedDetector {
        fn detect_text(&self, _image_url: &str) -> anyhow::Result<OcrResult> {
            Ok(OcrResult {
                regions: self.regions.clone(),
            })
        }
    }

    struct FailingDetector;

    impl TextDetector for FailingDetector {
        fn detect_text(&self, _image_url: &str) -> anyhow::Result<OcrResult> {
            anyhow::bail!("ocr unavailable")
        }
    }

    struct FixedAnalyser;

    impl BackgroundAnalyser for FixedAnalyser {
        fn describe_background(&self, _image_url: &str) -> anyhow::Result<BackgroundPrompt> {
            Ok(BackgroundPrompt {
                background_prompt: "a calm gradient background".to_string(),
            })
        }
    }

    struct FailingAnalyser;

    impl BackgroundAnalyser for FailingAnalyser {
        fn describe_background(&self, _image_url: &str) -> anyhow::Result<BackgroundPrompt> {
            anyhow::bail!("vision model unavailable")
        }
    }

    fn engine_with(
        temp: &tempfile::TempDir,
        inpaint: Box<dyn InpaintBackend>,
        detector: Box<dyn TextDetector>,
    ) -> anyhow::Result<ExtendImageEngine> {
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        Ok(ExtendImageEngine::new(
            inpaint,
            Box::new(FixedAnalyser),
            detector,
            Box::new(storage),
            ImageFetcher::new()?,
        ))
    }

    fn dryrun_engine(temp: &tempfile::TempDir) -> anyhow::Result<ExtendImageEngine> {
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        Ok(ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(FixedAnalyser),
            Box::new(DryrunDetector),
            Box::new(storage),
            ImageFetcher::new()?,
        ))
    }

    fn load_final_image(url: &str) -> anyhow::Result<RgbaImage> {
        let path = url.strip_prefix("file://").expect("file url");
        // Final objects are stored without a file extension, so sniff the
        // format from the bytes instead of the path.
        Ok(image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .to_rgba8())
    }

    fn request(target_width: u32, target_height: u32, original: BoxSpec) -> ExtendImageRequest {
        ExtendImageRequest {
            target_width,
            target_height,
            original_box: original,
            invert_text: false,
            remove_text: false,
        }
    }

    #[test]
    fn mask_marks_preserved_interior_and_fill_border() {
        let previous = Rect::new(100, 100, 300, 300);
        let expansion = Rect::new(80, 80, 320, 320);
        let mask = build_step_mask(previous, expansion, &ExtensionPolicy::default(), false);
        assert_eq!(mask.dimensions(), (240, 240));

        // Overlap is max(5, 0.05 * 200) = 10 per grown side; the preserved
        // rect spans columns 30..=210 inclusive.
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(120, 120)[0], 0);
        assert_eq!(mask.get_pixel(29, 120)[0], 255);
        assert_eq!(mask.get_pixel(30, 120)[0], 0);
        assert_eq!(mask.get_pixel(210, 120)[0], 0);
        assert_eq!(mask.get_pixel(211, 120)[0], 255);
    }

    #[test]
    fn mask_skips_overlap_on_sides_that_did_not_grow() {
        // Only the right and bottom sides grow.
        let previous = Rect::new(0, 0, 200, 200);
        let expansion = Rect::new(0, 0, 240, 240);
        let mask = build_step_mask(previous, expansion, &ExtensionPolicy::default(), false);

        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(190, 100)[0], 0);
        assert_eq!(mask.get_pixel(191, 100)[0], 255);
        assert_eq!(mask.get_pixel(100, 191)[0], 255);
        assert_eq!(mask.get_pixel(220, 220)[0], 255);
    }

    #[test]
    fn invert_text_swaps_mask_values_pointwise() {
        let previous = Rect::new(50, 50, 150, 150);
        let expansion = Rect::new(30, 30, 170, 170);
        let policy = ExtensionPolicy::default();
        let plain = build_step_mask(previous, expansion, &policy, false);
        let inverted = build_step_mask(previous, expansion, &policy, true);
        for (a, b) in plain.pixels().zip(inverted.pixels()) {
            assert_eq!(a[0], 255 - b[0]);
        }
    }

    #[test]
    fn degenerate_preserved_rect_leaves_mask_all_fill() {
        // A tiny previous box is swallowed whole by its own overlap margins.
        let previous = Rect::new(100, 100, 106, 106);
        let expansion = Rect::new(80, 80, 126, 126);
        let mask = build_step_mask(previous, expansion, &ExtensionPolicy::default(), false);
        assert!(mask.pixels().all(|pixel| pixel[0] == 255));
    }

    #[test]
    fn average_color_handles_gray_rgb_and_rgba() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([90])));
        assert_eq!(average_color(&gray), Rgba([90, 90, 90, 255]));

        let rgb = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            8,
            8,
            image::Rgb([10, 20, 30]),
        ));
        assert_eq!(average_color(&rgb), Rgba([10, 20, 30, 255]));

        let rgba = DynamicImage::ImageRgba8(solid(8, 8, [50, 60, 70, 255]));
        assert_eq!(average_color(&rgba), Rgba([50, 60, 70, 255]));
    }

    #[test]
    fn place_source_keeps_canvas_transparent_outside_opaque_pixels() {
        let mut canvas = solid(100, 100, [0, 0, 0, 0]);
        let mut source = solid(40, 40, [200, 10, 10, 255]);
        source.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        place_source(&mut canvas, &source, Rect::new(30, 30, 70, 70));

        assert_eq!(canvas.get_pixel(31, 31), &Rgba([200, 10, 10, 255]));
        assert_eq!(canvas.get_pixel(30, 30)[3], 0); // transparent source pixel
        assert_eq!(canvas.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn compose_tile_resizes_mismatched_tiles() {
        let mut canvas = solid(100, 100, [0, 0, 0, 0]);
        let tile = solid(17, 23, [5, 100, 5, 255]);
        compose_tile(&mut canvas, tile, Rect::new(10, 10, 50, 50));
        assert_eq!(canvas.get_pixel(30, 30), &Rgba([5, 100, 5, 255]));
        assert_eq!(canvas.get_pixel(60, 60)[3], 0);
    }

    #[test]
    fn crop_rect_matches_box_dimensions() {
        let canvas = solid(50, 80, [1, 2, 3, 255]);
        let crop = crop_rect(&canvas, Rect::new(10, 20, 30, 60));
        assert_eq!(crop.dimensions(), (20, 40));
    }

    #[test]
    fn text_patch_round_trips_at_unit_scale() {
        let mut original = solid(100, 100, [20, 20, 20, 255]);
        for x in 30..60 {
            for y in 40..50 {
                original.put_pixel(x, y, Rgba([250, 240, 10, 255]));
            }
        }
        let region = rect_region(30.0, 40.0, 60.0, 50.0);
        let patches = save_text_patches(&original, &[region.clone()]);
        assert_eq!(patches.len(), 1);

        // Wipe the region, then restore at scale 1.0 and compare pixels.
        let mut canvas = original.clone();
        paint_regions(&mut canvas, &[region], Rgba([0, 0, 0, 255]));
        restore_patches(&mut canvas, &patches, 1.0, 1.0, (0, 0));
        for x in 31..59 {
            for y in 41..49 {
                assert_eq!(canvas.get_pixel(x, y), original.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn patches_with_degenerate_scaled_size_are_skipped() {
        let original = solid(100, 100, [20, 20, 20, 255]);
        let patches = save_text_patches(&original, &[rect_region(10.0, 10.0, 14.0, 14.0)]);
        let mut canvas = solid(10, 10, [0, 0, 0, 0]);
        restore_patches(&mut canvas, &patches, 0.01, 0.01, (0, 0));
        assert!(canvas.pixels().all(|pixel| pixel[3] == 0));
    }

    #[test]
    fn out_of_bounds_regions_are_clamped() {
        let original = solid(50, 50, [1, 1, 1, 255]);
        let patches = save_text_patches(&original, &[rect_region(40.0, 40.0, 80.0, 80.0)]);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].origin, Rect::new(40, 40, 50, 50));
    }

    #[test]
    fn combined_mask_covers_every_region() {
        let mask = combined_region_mask(
            100,
            100,
            &[
                rect_region(10.0, 10.0, 30.0, 20.0),
                rect_region(60.0, 60.0, 90.0, 80.0),
            ],
        );
        assert_eq!(mask.get_pixel(20, 15)[0], 255);
        assert_eq!(mask.get_pixel(70, 70)[0], 255);
        assert_eq!(mask.get_pixel(45, 45)[0], 0);
    }

    #[test]
    fn short_circuit_when_source_covers_target() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(
            &temp,
            Box::new(FailingBackend {
                calls: Arc::clone(&calls),
            }),
            Box::new(DryrunDetector),
        )?;

        let source = encode_png(&solid(200, 280, [80, 90, 100, 255]))?;
        let outcome = engine.extend_image(
            &request(
                1000,
                1400,
                BoxSpec {
                    x: 0,
                    y: 0,
                    width: 1000,
                    height: 1400,
                },
            ),
            &source,
            "user-1",
        )?;

        assert_eq!(outcome.status, CompletionStatus::AlreadyCovered);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let final_image = load_final_image(&outcome.asset.image_url)?;
        assert_eq!(final_image.dimensions(), (1000, 1400));
        assert_eq!(final_image.get_pixel(500, 700), &Rgba([80, 90, 100, 255]));
        Ok(())
    }

    #[test]
    fn failing_backend_yields_partial_success_after_one_iteration() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with(
            &temp,
            Box::new(FailingBackend {
                calls: Arc::clone(&calls),
            }),
            Box::new(DryrunDetector),
        )?;

        let source = encode_png(&solid(100, 100, [200, 40, 40, 255]))?;
        let outcome = engine.extend_image(
            &request(
                300,
                300,
                BoxSpec {
                    x: 100,
                    y: 100,
                    width: 100,
                    height: 100,
                },
            ),
            &source,
            "user-2",
        )?;

        assert_eq!(outcome.status, CompletionStatus::Stalled);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.coverage, Rect::new(100, 100, 200, 200));

        // The source is on the canvas; nothing beyond it was generated.
        let final_image = load_final_image(&outcome.asset.image_url)?;
        assert_eq!(final_image.get_pixel(150, 150), &Rgba([200, 40, 40, 255]));
        assert_eq!(final_image.get_pixel(10, 10)[3], 0);
        Ok(())
    }

    #[test]
    fn dryrun_loop_extends_to_full_coverage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = dryrun_engine(&temp)?;

        // At this geometry the area budget always admits at least one ring.
        let source = encode_png(&solid(400, 700, [10, 120, 60, 255]))?;
        let outcome = engine.extend_image(
            &request(
                1000,
                1200,
                BoxSpec {
                    x: 200,
                    y: 200,
                    width: 400,
                    height: 700,
                },
            ),
            &source,
            "user-3",
        )?;

        assert_eq!(outcome.status, CompletionStatus::Complete);
        assert!(outcome.iterations >= 2);
        assert!(outcome.coverage.covers_target(1000, 1200));

        // Every pixel got content: the dryrun backend fills the expansion.
        let final_image = load_final_image(&outcome.asset.image_url)?;
        assert!(final_image.pixels().all(|pixel| pixel[3] == 255));
        Ok(())
    }

    #[test]
    fn small_budget_stalls_with_partial_coverage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        // Expansion rings quickly outgrow the small area budget.
        let engine = dryrun_engine(&temp)?;

        let source = encode_png(&solid(100, 100, [10, 120, 60, 255]))?;
        let outcome = engine.extend_image(
            &request(
                300,
                300,
                BoxSpec {
                    x: 100,
                    y: 100,
                    width: 100,
                    height: 100,
                },
            ),
            &source,
            "user-3b",
        )?;

        assert_eq!(outcome.status, CompletionStatus::Stalled);
        assert!(outcome.iterations >= 1);
        assert!(!outcome.coverage.covers_target(300, 300));
        assert!(outcome.coverage.contains(&Rect::new(100, 100, 200, 200)));
        Ok(())
    }

    #[test]
    fn iteration_cap_ends_loop_with_partial_coverage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let engine = ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(FixedAnalyser),
            Box::new(DryrunDetector),
            Box::new(storage),
            ImageFetcher::new()?,
        )
        .with_policy(ExtensionPolicy {
            max_iterations: 1,
            ..ExtensionPolicy::default()
        });

        // One iteration cannot close a 200px gap on the left side.
        let source = encode_png(&solid(400, 700, [60, 60, 60, 255]))?;
        let outcome = engine.extend_image(
            &request(
                1000,
                1200,
                BoxSpec {
                    x: 200,
                    y: 200,
                    width: 400,
                    height: 700,
                },
            ),
            &source,
            "user-3c",
        )?;

        assert_eq!(outcome.status, CompletionStatus::IterationCapped);
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.coverage.covers_target(1000, 1200));
        assert!(outcome.coverage.contains(&Rect::new(200, 200, 600, 900)));
        Ok(())
    }

    #[test]
    fn detection_failure_degrades_to_zero_regions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let engine = ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(FixedAnalyser),
            Box::new(FailingDetector),
            Box::new(storage),
            ImageFetcher::new()?,
        );

        let source = encode_png(&solid(120, 120, [90, 90, 200, 255]))?;
        let mut req = request(
            120,
            120,
            BoxSpec {
                x: 0,
                y: 0,
                width: 120,
                height: 120,
            },
        );
        req.remove_text = true;
        let outcome = engine.extend_image(&req, &source, "user-4")?;
        assert_eq!(outcome.status, CompletionStatus::AlreadyCovered);
        Ok(())
    }

    #[test]
    fn removed_text_is_restored_even_on_the_short_circuit_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut original = solid(100, 100, [40, 40, 40, 255]);
        for x in 20..80 {
            for y in 45..55 {
                original.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        // Removal falls back to average-color fill; patches still restore.
        let engine = engine_with(
            &temp,
            Box::new(FailingBackend {
                calls: Arc::clone(&calls),
            }),
            Box::new(FixedDetector {
                regions: vec![rect_region(20.0, 45.0, 80.0, 55.0)],
            }),
        )?;

        let mut req = request(
            100,
            100,
            BoxSpec {
                x: 0,
                y: 0,
                width: 100,
                height: 100,
            },
        );
        req.remove_text = true;
        let outcome = engine.extend_image(&req, &encode_png(&original)?, "user-5")?;
        assert_eq!(outcome.status, CompletionStatus::AlreadyCovered);

        let final_image = load_final_image(&outcome.asset.image_url)?;
        for x in 21..79 {
            for y in 46..54 {
                assert_eq!(
                    final_image.get_pixel(x, y),
                    original.get_pixel(x, y),
                    "pixel ({x},{y}) should match the pre-removal source"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn remove_text_round_trip_through_dryrun_removal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut original = solid(200, 200, [30, 60, 90, 255]);
        for x in 50..150 {
            for y in 90..110 {
                original.put_pixel(x, y, Rgba([240, 240, 240, 255]));
            }
        }

        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let engine = ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(FixedAnalyser),
            Box::new(FixedDetector {
                regions: vec![rect_region(50.0, 90.0, 150.0, 110.0)],
            }),
            Box::new(storage),
            ImageFetcher::new()?,
        );

        let mut req = request(
            200,
            200,
            BoxSpec {
                x: 0,
                y: 0,
                width: 200,
                height: 200,
            },
        );
        req.remove_text = true;
        let outcome = engine.extend_image(&req, &encode_png(&original)?, "user-6")?;

        let final_image = load_final_image(&outcome.asset.image_url)?;
        for x in 51..149 {
            for y in 91..109 {
                assert_eq!(final_image.get_pixel(x, y), original.get_pixel(x, y));
            }
        }
        Ok(())
    }

    #[test]
    fn invalid_image_bytes_fail_fast() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = dryrun_engine(&temp)?;
        let result = engine.extend_image(
            &request(
                100,
                100,
                BoxSpec {
                    x: 0,
                    y: 0,
                    width: 100,
                    height: 100,
                },
            ),
            b"not an image",
            "user-7",
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn background_analysis_failure_is_fatal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let engine = ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(FailingAnalyser),
            Box::new(DryrunDetector),
            Box::new(storage),
            ImageFetcher::new()?,
        );

        let source = encode_png(&solid(50, 50, [1, 2, 3, 255]))?;
        let result = engine.extend_image(
            &request(
                100,
                100,
                BoxSpec {
                    x: 0,
                    y: 0,
                    width: 100,
                    height: 100,
                },
            ),
            &source,
            "user-8",
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn disk_storage_content_addresses_temp_objects() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let first = storage.put_temp(b"same bytes", ".png")?;
        let second = storage.put_temp(b"same bytes", ".png")?;
        assert_eq!(first, second);
        assert!(first.starts_with("file://"));
        Ok(())
    }

    #[test]
    fn disk_storage_writes_metadata_sidecar() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path()).with_base_url(None);
        let metadata = easel_contracts::UploadMetadata {
            artwork_type: "extended_image".to_string(),
            user_id: "user-9".to_string(),
            artwork_status: "final".to_string(),
            artwork_width: "10".to_string(),
            artwork_height: "10".to_string(),
        };
        storage.put_object(b"png", "users/user-9/extended_image/a", &metadata)?;
        let sidecar = temp.path().join("users/user-9/extended_image/a.json");
        let raw = std::fs::read_to_string(sidecar)?;
        assert!(raw.contains("extended_image"));
        Ok(())
    }

    #[test]
    fn disk_storage_base_url_replaces_file_scheme() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = DiskStorage::new(temp.path())
            .with_base_url(Some("https://media.example.com/".to_string()));
        let url = storage.put_temp(b"bytes", ".png")?;
        assert!(url.starts_with("https://media.example.com/tmp/"));
        Ok(())
    }
}
