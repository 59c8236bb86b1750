//! Prism headless frame driver
//!
//! Initializes a device without a window, uploads a mip-mapped texture and
//! drives frames through the frame renderer into an off-screen image.
//! Kernels are stand-ins that clear their outputs, so no shaders are needed.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-headless -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--adapter <N>`: Adapter index (default: 0)
//! - `--frames <N>`: Frames to render (default: 60)
//! - `--width <W>`: Target width (default: 1280)
//! - `--height <H>`: Target height (default: 720)
//! - `--validation`: Enable the Khronos validation layer
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::Context;
use ash::vk;
use glam::{Mat4, Vec3};
use prism_gpu::{DeviceConfig, DeviceContext, ImageDesc, WindowParams};
use prism_render::{
    clearing_passes, Camera, FrameRenderer, FrameState, Mesh, MeshInstance, RendererConfig,
    SwapchainFrame,
};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TEXTURE_SIZE: u32 = 64;
const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Command-line configuration.
#[derive(Debug, Clone)]
struct HeadlessConfig {
    adapter: usize,
    frames: u64,
    width: u32,
    height: u32,
    validation: bool,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            adapter: 0,
            frames: 60,
            width: 1280,
            height: 720,
            validation: false,
        }
    }
}

impl HeadlessConfig {
    /// Parse the configuration from command line arguments.
    fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut config = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--adapter" => parse_next(&mut args, &mut config.adapter),
                "--frames" => parse_next(&mut args, &mut config.frames),
                "--width" => parse_next(&mut args, &mut config.width),
                "--height" => parse_next(&mut args, &mut config.height),
                "--validation" => config.validation = true,
                other => tracing::warn!(argument = other, "Ignoring unknown argument"),
            }
        }
        config
    }

    fn device_config(&self, ray_tracing: bool) -> DeviceConfig {
        DeviceConfig::new()
            .app_name("prism-headless")
            .validation(self.validation)
            .ray_tracing(ray_tracing)
    }
}

fn parse_next<T: std::str::FromStr>(args: &mut impl Iterator<Item = String>, slot: &mut T) {
    match args.next().map(|value| value.parse()) {
        Some(Ok(value)) => *slot = value,
        _ => tracing::warn!("Missing or invalid option value, keeping default"),
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }
    init_logging();

    let config = HeadlessConfig::from_args();
    tracing::info!(?config, "Starting headless run");
    run(&config)
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,prism_gpu=trace,prism_render=trace,prism_headless=trace")
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn run(config: &HeadlessConfig) -> anyhow::Result<()> {
    let ray_tracing = probe_ray_tracing(config)?;
    let mut context = DeviceContext::initialize(&config.device_config(ray_tracing))
        .context("Failed to initialize Vulkan")?;
    context
        .select_and_init_device(config.adapter)
        .with_context(|| format!("Failed to initialize adapter {}", config.adapter))?;

    let texture = upload_texture(&context)?;
    let _texture_view = context.create_image_view(&texture)?;

    let (meshes, instances) = if ray_tracing {
        build_scene(&context)?
    } else {
        tracing::warn!("Adapter has no ray tracing support, rendering an empty scene");
        (Vec::new(), Vec::new())
    };

    let window = WindowParams::new(config.width, config.height);
    let mut renderer = FrameRenderer::new(
        &context,
        RendererConfig {
            color_format: COLOR_FORMAT,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            clear_color: [0.1, 0.1, 0.15, 1.0],
            window,
            ..RendererConfig::default()
        },
        |_| Ok(clearing_passes()),
    )?;

    let target = context.create_image(&ImageDesc::new_2d(
        "headless_color",
        COLOR_FORMAT,
        window.width,
        window.height,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
    ))?;
    let target_view = context.create_image_view(&target)?;
    let frame = SwapchainFrame::offscreen(
        0,
        target.handle(),
        target_view.handle(),
        vk::Extent2D {
            width: window.width,
            height: window.height,
        },
    );

    let aspect = window.width as f32 / window.height as f32;
    let dest = context.main_command_buffer()?;
    for frame_index in 0..config.frames {
        let angle = frame_index as f32 * 0.05;
        let camera = Camera::looking_at(
            Vec3::new(angle.sin() * 6.0, 2.0, angle.cos() * 6.0),
            Vec3::ZERO,
            aspect,
        );
        let scene = FrameState {
            revision: 1,
            meshes: &meshes,
            instances: &instances,
            camera,
            frame_index,
        };

        let submissions = renderer.render(&context, &scene, dest, &frame)?;
        let dispatched = context.dispatch_to_gpu(&submissions);
        drop(submissions);
        if let Err(err) = dispatched {
            tracing::error!(%err, frame = frame_index, "Submission failed, skipping frame");
            renderer.frame_lost();
            continue;
        }
        if let Some(done) = dest.completion() {
            context.wait(&[done])?;
        }
    }

    let times = renderer.frame_times();
    tracing::info!(
        frames = config.frames,
        average_record_us = times.average().map_or(0, |t| t.as_micros() as u64),
        "Headless run finished"
    );
    context.wait_for_gpu()?;
    Ok(())
}

/// Whether the selected adapter can run the ray tracing extensions.
fn probe_ray_tracing(config: &HeadlessConfig) -> anyhow::Result<bool> {
    let probe = DeviceContext::initialize(&config.device_config(false))
        .context("Failed to initialize Vulkan")?;
    for id in 0..probe.adapter_count() {
        let info = probe.adapter_info(id)?;
        let marker = if id == config.adapter { "*" } else { " " };
        println!("{marker} [{id}] {}", info.summary());
    }
    let info = probe
        .adapter_info(config.adapter)
        .with_context(|| format!("Adapter {} does not exist", config.adapter))?;
    let required = config.device_config(true).device_extensions();
    let missing = info.missing_extensions(required.iter().map(String::as_str));
    Ok(info.ray_tracing.is_supported() && missing.is_empty())
}

/// Upload a checkerboard with a full mip chain.
fn upload_texture(context: &DeviceContext) -> anyhow::Result<prism_gpu::Image> {
    let mips = checkerboard_mips(TEXTURE_SIZE);
    let slices: Vec<&[u8]> = mips.iter().map(Vec::as_slice).collect();
    let desc = ImageDesc::new_2d(
        "checkerboard",
        vk::Format::R8G8B8A8_UNORM,
        TEXTURE_SIZE,
        TEXTURE_SIZE,
        vk::ImageUsageFlags::SAMPLED,
    )
    .mip_levels(mips.len() as u32);
    let image = context
        .create_image_with_data(&desc, &slices)
        .context("Failed to upload texture")?;
    tracing::info!(levels = mips.len(), size = TEXTURE_SIZE, "Uploaded texture");
    Ok(image)
}

fn checkerboard_mips(size: u32) -> Vec<Vec<u8>> {
    let mut mips = Vec::new();
    let mut extent = size;
    while extent > 0 {
        let cell = (extent / 8).max(1);
        let mut pixels = Vec::with_capacity((extent * extent * 4) as usize);
        for y in 0..extent {
            for x in 0..extent {
                let value = if (x / cell + y / cell) % 2 == 0 { 255 } else { 32 };
                pixels.extend_from_slice(&[value, value, value, 255]);
            }
        }
        mips.push(pixels);
        extent /= 2;
    }
    mips
}

fn build_scene(context: &DeviceContext) -> anyhow::Result<(Vec<Mesh>, Vec<MeshInstance>)> {
    let ground = Mesh::new(
        context,
        "ground",
        &[
            [-10.0, 0.0, -10.0],
            [10.0, 0.0, -10.0],
            [10.0, 0.0, 10.0],
            [-10.0, 0.0, 10.0],
        ],
        &[0, 1, 2, 0, 2, 3],
    )?;
    let triangle = Mesh::new(
        context,
        "triangle",
        &[[-1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 2.0, 0.0]],
        &[0, 1, 2],
    )?;
    let mut instances = vec![MeshInstance::new(0, Mat4::IDENTITY)];
    for i in 0..3u32 {
        let offset = Vec3::new(i as f32 * 3.0 - 3.0, 0.0, 0.0);
        instances.push(MeshInstance {
            custom_index: i + 1,
            ..MeshInstance::new(1, Mat4::from_translation(offset))
        });
    }
    Ok((vec![ground, triangle], instances))
}

fn print_help() {
    eprintln!(
        "Prism headless frame driver

USAGE:
    cargo run -p prism-headless -- [OPTIONS]

OPTIONS:
    --adapter <N>   Adapter index (default: 0)
    --frames <N>    Frames to render (default: 60)
    --width <W>     Target width (default: 1280)
    --height <H>    Target height (default: 720)
    --validation    Enable the Khronos validation layer
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> HeadlessConfig {
        HeadlessConfig::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_when_no_arguments() {
        let config = parse(&[]);
        assert_eq!(config.adapter, 0);
        assert_eq!(config.frames, 60);
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(!config.validation);
    }

    #[test]
    fn parses_every_option() {
        let config = parse(&[
            "--adapter", "1", "--frames", "5", "--width", "640", "--height", "480",
            "--validation",
        ]);
        assert_eq!(config.adapter, 1);
        assert_eq!(config.frames, 5);
        assert_eq!((config.width, config.height), (640, 480));
        assert!(config.validation);
    }

    #[test]
    fn invalid_value_keeps_default() {
        let config = parse(&["--frames", "many", "--width"]);
        assert_eq!(config.frames, 60);
        assert_eq!(config.width, 1280);
    }

    #[test]
    fn mip_chain_halves_down_to_one_pixel() {
        let mips = checkerboard_mips(8);
        let sizes: Vec<usize> = mips.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![256, 64, 16, 4]);
    }
}
