use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::recognizer::ARCFACE_EMBEDDING_DIM;
use facewatch_core::{
    ArcFaceEngine, CosineMatcher, EmbeddingExtractor, FaceDetector, FaceResult, Matcher,
    ReferenceLoader, ScrfdDetector,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face recognition tools")]
struct Cli {
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, env = "FACEWATCH_MODEL_DIR", global = true)]
    model_dir: Option<PathBuf>,

    /// Base URL of a running facewatchd
    #[arg(long, env = "FACEWATCH_URL", default_value = "http://127.0.0.1:5001", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a reference store from a directory and print per-person counts
    Scan {
        /// Root directory laid out as <root>/<person>/<image>
        dir: PathBuf,
    },
    /// Detect and identify faces in a still image
    Identify {
        image: PathBuf,
        /// Reference root to match against
        #[arg(long, env = "FACEWATCH_FACES_DIR")]
        faces_dir: PathBuf,
        #[arg(long, default_value_t = 0.7)]
        threshold: f32,
    },
    /// List V4L2 capture devices
    Devices,
    /// Show faces the daemon currently labels "Unknown"
    Unknowns,
    /// Enroll a face region from the daemon's live frame
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Region as x1,y1,x2,y2
        #[arg(long, value_parser = parse_bbox)]
        bbox: [i32; 4],
        #[arg(long)]
        frames: Option<usize>,
        /// Seconds between samples
        #[arg(long)]
        interval: Option<f64>,
    },
}

fn parse_bbox(s: &str) -> Result<[i32; 4], String> {
    let parts: Vec<i32> = s
        .split(',')
        .map(|p| p.trim().parse::<i32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    parts
        .try_into()
        .map_err(|v: Vec<i32>| format!("expected 4 comma-separated values, got {}", v.len()))
}

fn model_dir(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch/models")
    })
}

fn load_engines(model_dir: &Path) -> Result<(ScrfdDetector, ArcFaceEngine)> {
    let scrfd = model_dir.join("det_10g.onnx");
    let arcface = model_dir.join("w600k_r50.onnx");
    let detector =
        ScrfdDetector::load(&scrfd).with_context(|| format!("loading {}", scrfd.display()))?;
    let engine =
        ArcFaceEngine::load(&arcface).with_context(|| format!("loading {}", arcface.display()))?;
    Ok((detector, engine))
}

fn loader(model_dir: &Path) -> Result<ReferenceLoader> {
    let (detector, engine) = load_engines(model_dir)?;
    Ok(ReferenceLoader::new(Box::new(detector), Box::new(engine))
        .with_expected_dim(ARCFACE_EMBEDDING_DIM))
}

fn scan(model_dir: &Path, dir: &Path) -> Result<()> {
    let (gallery, report) = loader(model_dir)?.build(dir)?;
    for person in gallery.summary() {
        println!("{:<24} {}", person.name, person.embeddings);
    }
    println!();
    println!(
        "{} persons, {} embeddings ({} unreadable, {} without a face, \
         {} with several faces, {} failed)",
        report.persons,
        report.embeddings,
        report.unreadable,
        report.no_face,
        report.multiple_faces,
        report.detection_failed + report.extraction_failed,
    );
    Ok(())
}

fn identify(model_dir: &Path, image_path: &Path, faces_dir: &Path, threshold: f32) -> Result<()> {
    let (gallery, _) = loader(model_dir)?.build(faces_dir)?;
    if !gallery.is_usable() {
        tracing::warn!(
            faces_dir = %faces_dir.display(),
            "no usable reference faces; every face is unknown"
        );
    }

    let image = image::open(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?
        .to_rgb8();
    let (mut detector, engine) = load_engines(model_dir)?;
    let mut extractor = EmbeddingExtractor::new(engine).with_expected_dim(ARCFACE_EMBEDDING_DIM);

    let mut results = Vec::new();
    for region in detector.detect(&image)? {
        match extractor.extract(&image, &region) {
            Ok(embedding) => {
                let matched = CosineMatcher.best_match(&gallery, &embedding, threshold);
                results.push(FaceResult::new(region.bbox, matched));
            }
            Err(e) => {
                tracing::warn!(bbox = ?region.bbox, reason = e.reason(), error = %e, "face skipped")
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn devices() {
    let devices = facewatch_hw::camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

async fn check(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.context("daemon returned a non-JSON body")?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        bail!("{status}: {message}");
    }
    Ok(body)
}

async fn unknowns(client: &reqwest::Client, url: &str) -> Result<()> {
    let response = client.get(format!("{url}/api/unknown_faces")).send().await?;
    let body = check(response).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn enroll(
    client: &reqwest::Client,
    url: &str,
    name: &str,
    bbox: [i32; 4],
    frames: Option<usize>,
    interval: Option<f64>,
) -> Result<()> {
    let mut request = json!({ "name": name, "bbox": bbox });
    if let Some(frames) = frames {
        request["frameCount"] = json!(frames);
    }
    if let Some(interval) = interval {
        request["interval"] = json!(interval);
    }

    let response = client.post(format!("{url}/api/add_face")).json(&request).send().await?;
    let body = check(response).await?;
    let saved = body["saved"].as_u64().unwrap_or(0);
    if saved == 0 {
        bail!("no images saved for {name}; is the daemon streaming?");
    }
    println!("Saved {saved} image(s) for {name}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let url = cli.url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Scan { dir } => scan(&model_dir(cli.model_dir), &dir)?,
        Commands::Identify {
            image,
            faces_dir,
            threshold,
        } => identify(&model_dir(cli.model_dir), &image, &faces_dir, threshold)?,
        Commands::Devices => devices(),
        Commands::Unknowns => unknowns(&client, &url).await?,
        Commands::Enroll {
            name,
            bbox,
            frames,
            interval,
        } => enroll(&client, &url, &name, bbox, frames, interval).await?,
    }

    Ok(())
}
