//! Off-screen destinations and test scenes for frame renderer tests.

use ash::vk;
use glam::{Mat4, Vec3};
use prism_gpu::{DeviceContext, Image, ImageDesc, ImageView};
use prism_render::{Camera, FrameRenderer, FrameState, Mesh, MeshInstance, SwapchainFrame};

use crate::harness::HeadlessDevice;
use crate::Result;

/// A color image standing in for a swapchain image.
pub struct OffscreenTarget {
    pub view: ImageView,
    pub image: Image,
    pub extent: vk::Extent2D,
}

impl OffscreenTarget {
    pub fn new(context: &DeviceContext, format: vk::Format, width: u32, height: u32) -> Result<Self> {
        let image = context.create_image(&ImageDesc::new_2d(
            "offscreen_color",
            format,
            width,
            height,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        ))?;
        let view = context.create_image_view(&image)?;
        Ok(Self {
            view,
            image,
            extent: vk::Extent2D { width, height },
        })
    }

    /// The target as swapchain image 0, without presentation primitives.
    pub fn frame(&self) -> SwapchainFrame<'static> {
        SwapchainFrame::offscreen(0, self.image.handle(), self.view.handle(), self.extent)
    }
}

/// Meshes and instances that outlive the frames rendering them.
#[derive(Default)]
pub struct TestScene {
    pub meshes: Vec<Mesh>,
    pub instances: Vec<MeshInstance>,
    pub revision: u64,
}

impl TestScene {
    pub fn frame(&self, camera: Camera, frame_index: u64) -> FrameState<'_> {
        FrameState {
            revision: self.revision,
            meshes: &self.meshes,
            instances: &self.instances,
            camera,
            frame_index,
        }
    }
}

/// One triangle instanced twice, in front of the default camera.
pub fn triangle_scene(context: &DeviceContext) -> Result<TestScene> {
    let mesh = Mesh::new(
        context,
        "triangle",
        &[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]],
        &[0, 1, 2],
    )?;
    let instances = vec![
        MeshInstance::new(0, Mat4::IDENTITY),
        MeshInstance {
            custom_index: 1,
            ..MeshInstance::new(0, Mat4::from_translation(Vec3::new(2.5, 0.0, -1.0)))
        },
    ];
    Ok(TestScene {
        meshes: vec![mesh],
        instances,
        revision: 1,
    })
}

/// Record, submit and wait for one frame into `target`, using the main
/// command buffer as the destination.
pub fn render_and_wait(
    device: &HeadlessDevice,
    renderer: &mut FrameRenderer,
    scene: &FrameState<'_>,
    target: &OffscreenTarget,
) -> Result<()> {
    let context = device.context();
    let dest = context.main_command_buffer()?;
    let frame = target.frame();
    let submissions = renderer.render(context, scene, dest, &frame)?;
    context.dispatch_to_gpu(&submissions)?;
    drop(submissions);
    if let Some(done) = dest.completion() {
        context.wait(&[done])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::{CommandBuffer, GpuError, WindowParams};
    use prism_render::{
        clearing_passes, FnPass, FramePass, GuiOverlay, PassDecl, PassFlags, RenderError,
        RendererConfig, ResourceId, FRAMEBUFFER_CACHE_SIZE,
    };
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

    fn offscreen_config(width: u32, height: u32) -> RendererConfig {
        RendererConfig {
            color_format: vk::Format::R8G8B8A8_UNORM,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            clear_color: GREEN,
            window: WindowParams::new(width, height),
            ..RendererConfig::default()
        }
    }

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn logging_pass(name: &'static str, decl: PassDecl, log: &Log) -> Box<dyn FramePass> {
        let log = Rc::clone(log);
        Box::new(FnPass::new(decl, move |_| {
            log.borrow_mut().push(name);
            Ok(())
        }))
    }

    // geometry -> shade -> present, with geometry gated on scene changes
    fn logged_passes(log: &Log) -> Vec<Box<dyn FramePass>> {
        let geometry = ResourceId("geometry");
        let shaded = ResourceId("shaded");
        vec![
            logging_pass(
                "present",
                PassDecl::new("present")
                    .reads([shaded])
                    .flags(PassFlags::DESTINATION),
                log,
            ),
            logging_pass(
                "shade",
                PassDecl::new("shade").reads([geometry]).writes([shaded]),
                log,
            ),
            logging_pass(
                "geometry",
                PassDecl::new("geometry")
                    .writes([geometry])
                    .flags(PassFlags::ON_GEOMETRY_CHANGE),
                log,
            ),
        ]
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clearing_frame_leaves_clear_color() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(64, 64), |_| Ok(clearing_passes()))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 64, 64).unwrap();
        let scene = TestScene::default();

        for frame_index in 0..3 {
            render_and_wait(
                &device,
                &mut renderer,
                &scene.frame(Camera::default(), frame_index),
                &target,
            )
            .unwrap();
        }

        let pixels = device
            .read_rgba8(&target.image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        assert!(pixels.pixels().all(|p| p.0 == [0, 255, 0, 255]));
        assert_eq!(renderer.frame_times().len(), 3);
        assert_eq!(renderer.built_revision(), Some(0));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn geometry_passes_run_only_on_change() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let log = Log::default();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(logged_passes(&log)))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let mut scene = TestScene::default();

        let mut render = |scene: &TestScene, index| {
            render_and_wait(
                &device,
                &mut renderer,
                &scene.frame(Camera::default(), index),
                &target,
            )
            .unwrap();
            log.borrow_mut().drain(..).collect::<Vec<_>>()
        };

        assert_eq!(render(&scene, 0), ["geometry", "shade", "present"]);
        assert_eq!(render(&scene, 1), ["shade", "present"]);
        scene.revision += 1;
        assert_eq!(render(&scene, 2), ["geometry", "shade", "present"]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn lost_frame_rebuilds_geometry() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let log = Log::default();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(logged_passes(&log)))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let scene = TestScene::default();
        let dest = context.main_command_buffer().unwrap();
        let frame = target.frame();

        // Recorded but never submitted
        let submissions = renderer
            .render(context, &scene.frame(Camera::default(), 0), dest, &frame)
            .unwrap();
        drop(submissions);
        assert_eq!(renderer.built_revision(), Some(scene.revision));
        renderer.frame_lost();
        assert_eq!(renderer.built_revision(), None);
        log.borrow_mut().clear();

        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 1), &target)
            .unwrap();
        assert_eq!(*log.borrow(), ["geometry", "shade", "present"]);
        assert_eq!(renderer.built_revision(), Some(scene.revision));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn failed_pass_abandons_frame() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let failures = Rc::new(Cell::new(1));
        let mut renderer = FrameRenderer::new(context, offscreen_config(32, 32), |_| {
            let failures = Rc::clone(&failures);
            let mut passes = clearing_passes();
            passes.push(Box::new(FnPass::new(PassDecl::new("flaky"), move |_| {
                if failures.get() > 0 {
                    failures.set(failures.get() - 1);
                    return Err(RenderError::MissingResource("flaky"));
                }
                Ok(())
            })));
            Ok(passes)
        })
        .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let scene = TestScene::default();

        let err = render_and_wait(
            &device,
            &mut renderer,
            &scene.frame(Camera::default(), 0),
            &target,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::TestError::Render(RenderError::PassFailed { ref pass, .. }) if pass == "flaky"
        ));
        assert_eq!(renderer.built_revision(), None);
        assert!(renderer.frame_times().is_empty());

        render_and_wait(
            &device,
            &mut renderer,
            &scene.frame(Camera::default(), 1),
            &target,
        )
        .unwrap();
        assert_eq!(renderer.frame_times().len(), 1);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn pending_destination_is_rejected() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(clearing_passes()))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let scene = TestScene::default();
        let dest = context.main_command_buffer().unwrap();
        let frame = target.frame();

        let submissions = renderer
            .render(context, &scene.frame(Camera::default(), 0), dest, &frame)
            .unwrap();
        context.dispatch_to_gpu(&submissions).unwrap();
        drop(submissions);

        let second = renderer.render(context, &scene.frame(Camera::default(), 1), dest, &frame);
        assert!(matches!(
            second,
            Err(RenderError::Gpu(GpuError::InvalidState(_)))
        ));
        context.wait(&[dest.completion().unwrap()]).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn resize_recreates_targets() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(clearing_passes()))
                .unwrap();
        let scene = TestScene::default();
        let small = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 0), &small)
            .unwrap();

        let large = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 96, 48).unwrap();
        assert!(render_and_wait(
            &device,
            &mut renderer,
            &scene.frame(Camera::default(), 1),
            &large
        )
        .is_err());

        let generation = renderer.resources().target_generation();
        renderer
            .on_resize(context, WindowParams::new(96, 48))
            .unwrap();
        assert_eq!(renderer.resources().target_generation(), generation + 1);
        assert_eq!(renderer.config().window, WindowParams::new(96, 48));
        assert!(renderer
            .on_resize(context, WindowParams::new(0, 48))
            .is_err());

        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 2), &large)
            .unwrap();
        let pixels = device
            .read_rgba8(&large.image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        assert_eq!(pixels.dimensions(), (96, 48));
    }

    struct CountingOverlay(Rc<Cell<u32>>);

    impl GuiOverlay for CountingOverlay {
        fn draw(
            &mut self,
            _cmd: &CommandBuffer,
            _scene: &FrameState<'_>,
        ) -> prism_render::Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn overlay_draws_only_when_staged() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(clearing_passes()))
                .unwrap();
        let draws = Rc::new(Cell::new(0));
        renderer.set_overlay(Box::new(CountingOverlay(Rc::clone(&draws))));
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let scene = TestScene::default();

        let state = scene.frame(Camera::default(), 0);
        renderer.draw_gui(&state);
        render_and_wait(&device, &mut renderer, &state, &target).unwrap();
        assert_eq!(draws.get(), 1);

        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 1), &target)
            .unwrap();
        assert_eq!(draws.get(), 1);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn framebuffers_are_cached_per_image() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(clearing_passes()))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();

        let first = renderer.framebuffer(context, &target.frame()).unwrap().handle();
        let second = renderer.framebuffer(context, &target.frame()).unwrap().handle();
        assert_eq!(first, second);

        let out_of_range = SwapchainFrame {
            image_index: FRAMEBUFFER_CACHE_SIZE,
            ..target.frame()
        };
        assert!(matches!(
            renderer.framebuffer(context, &out_of_range),
            Err(RenderError::FramebufferIndex { .. })
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn acceleration_structures_follow_scene_revision() {
        let device = HeadlessDevice::with_ray_tracing().unwrap();
        let context = device.context();
        let mut renderer =
            FrameRenderer::new(context, offscreen_config(32, 32), |_| Ok(clearing_passes()))
                .unwrap();
        let target = OffscreenTarget::new(context, vk::Format::R8G8B8A8_UNORM, 32, 32).unwrap();
        let scene = triangle_scene(context).unwrap();

        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 0), &target)
            .unwrap();
        assert_eq!(renderer.built_revision(), Some(scene.revision));
        assert_eq!(renderer.resources().blas().len(), 1);
        let tlas = renderer.resources().tlas().unwrap();
        assert_eq!(tlas.instance_count(), 2);
        let generation = renderer.resources().tlas_generation();

        render_and_wait(&device, &mut renderer, &scene.frame(Camera::default(), 1), &target)
            .unwrap();
        assert_eq!(renderer.resources().tlas_generation(), generation);
    }
}
