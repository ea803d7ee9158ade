//! Frame sequencing tests for j3d-render.
//!
//! These run the renderer against the recording backend, so they need no
//! GPU and check the order of passes, composites and state instead of
//! pixels.

use std::sync::Arc;

use j3d_core::{
    Appearance, Background, ContentNode, Grid, Light3D, Mat4, Node3D, Object3D, RenderStyle,
    RendererConfiguration, Scene, StateCacheMode, Vec3, Vec4,
};
use j3d_render::{
    ColorTarget, Command, CompositeMode, CompositeSource, CullFace, DrawRecord, FrameStatistics,
    MemoryImageSource, RecordingBackend, Renderer,
};

fn config() -> RendererConfiguration {
    RendererConfiguration {
        asynchronous_textures: false,
        ..RendererConfiguration::default()
    }
}

fn renderer(config: RendererConfiguration) -> Renderer<RecordingBackend> {
    Renderer::with_image_source(
        RecordingBackend::new(64, 48),
        config,
        Arc::new(MemoryImageSource::new()),
    )
    .unwrap()
}

fn render_with(
    renderer: &mut Renderer<RecordingBackend>,
    scene: &Scene,
    style: &RenderStyle,
    grid: &Grid,
) -> FrameStatistics {
    renderer
        .render_scene(scene, &[], style, &Background::default(), grid)
        .unwrap()
}

fn render(renderer: &mut Renderer<RecordingBackend>, scene: &Scene) -> FrameStatistics {
    render_with(renderer, scene, &RenderStyle::default(), &Grid::default())
}

fn cube() -> Object3D {
    Object3D::cuboid(
        Vec3::splat(-0.5),
        Vec3::splat(0.5),
        Arc::new(Appearance::from_color(Vec4::new(0.2, 0.4, 0.8, 1.0))),
    )
}

/// An opaque cube behind a half transparent quad.
fn cube_and_glass() -> Scene {
    let mut scene = Scene::new();
    scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube())));
    scene.add(ContentNode::new(
        "glass",
        Mat4::from_translation(Vec3::new(0.0, 0.0, 1.0)),
        Node3D::object(Object3D::colored_quad(2.0, 2.0, Vec4::new(1.0, 1.0, 1.0, 0.5))),
    ));
    scene
}

fn add_light(scene: &mut Scene, id: &str, light: Light3D) {
    scene.add(ContentNode::new(id, Mat4::IDENTITY, Node3D::Light(light)));
}

/// Draw records grouped by the pass they were issued in, for passes named
/// `label`.
fn draws_per_pass<'a>(backend: &'a RecordingBackend, label: &str) -> Vec<Vec<&'a DrawRecord>> {
    let mut passes = Vec::new();
    let mut current: Option<Vec<&DrawRecord>> = None;
    for command in backend.commands() {
        match command {
            Command::BeginPass(pass) => {
                current = (pass.label == label).then(Vec::new);
            }
            Command::EndPass => {
                if let Some(draws) = current.take() {
                    passes.push(draws);
                }
            }
            Command::Draw(draw) => {
                if let Some(draws) = current.as_mut() {
                    draws.push(draw);
                }
            }
            _ => {}
        }
    }
    passes
}

#[test]
fn test_single_transparent_layer_is_peeled() {
    let mut renderer = renderer(config());
    let stats = render(&mut renderer, &cube_and_glass());

    assert!(!stats.multi_pass);
    assert_eq!(stats.light_passes, 1);
    assert_eq!(stats.peel_layers, 1);
    assert_eq!(
        renderer.backend().composites(),
        vec![
            (CompositeSource::PeelLayer, CompositeMode::Under),
            (CompositeSource::PeelComposite, CompositeMode::Over),
        ]
    );

    // Only the glass is drawn while peeling, and nothing blends.
    let layers = draws_per_pass(renderer.backend(), "peel layer");
    assert_eq!(layers.len(), 2);
    assert!(layers.iter().all(|draws| draws.len() == 1));
    assert!(layers[0][0].program.as_deref().unwrap().ends_with("+peel"));
    assert!(layers.iter().flatten().all(|draw| draw.blend.is_none()));

    // The frame pass draws the cube only; the glass arrives as a composite.
    let frame = draws_per_pass(renderer.backend(), "frame");
    assert_eq!(frame.len(), 1);
    assert_eq!(frame[0].len(), 1);
}

#[test]
fn test_each_light_pass_peels_the_glass() {
    let mut renderer = renderer(config());
    let mut scene = cube_and_glass();
    add_light(
        &mut scene,
        "sun",
        Light3D::directional(Vec3::new(-0.3, -0.2, -1.0)).with_shadows(true),
    );
    add_light(&mut scene, "fill", Light3D::directional(Vec3::new(1.0, -0.5, -1.0)));

    let stats = render(&mut renderer, &scene);
    assert!(stats.multi_pass);
    assert_eq!(stats.light_passes, 2);
    assert_eq!(stats.shadow_maps, 1);
    assert_eq!(stats.peel_layers, stats.light_passes);

    // Per pass: the layer goes under the composite, the composite over the
    // frame; the second pass is then added onto the first.
    let backend = renderer.backend();
    assert_eq!(
        backend.composites(),
        vec![
            (CompositeSource::PeelLayer, CompositeMode::Under),
            (CompositeSource::PeelComposite, CompositeMode::Over),
            (CompositeSource::PeelLayer, CompositeMode::Under),
            (CompositeSource::PeelComposite, CompositeMode::Over),
            (CompositeSource::Accumulation, CompositeMode::Additive),
        ]
    );

    // Only the shadowed light peels against its shadow map.
    let layers: Vec<_> = backend
        .passes()
        .into_iter()
        .filter(|pass| pass.label == "peel layer")
        .collect();
    assert_eq!(layers.len(), 4);
    assert!(layers[..2].iter().all(|pass| pass.shadow.is_some()));
    assert!(layers[2..].iter().all(|pass| pass.shadow.is_none()));
    assert!(draws_per_pass(backend, "peel layer")
        .iter()
        .flatten()
        .filter_map(|draw| draw.program.as_deref())
        .all(|label| label.ends_with("+peel")));
}

#[test]
fn test_opaque_scene_peels_nothing() {
    let mut renderer = renderer(config());
    let mut scene = Scene::new();
    scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube())));
    let stats = render(&mut renderer, &scene);

    assert_eq!(stats.peel_layers, 0);
    // One query finds the empty layer; nothing is composited.
    let queries = renderer
        .backend()
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::BeginOcclusionQuery))
        .count();
    assert_eq!(queries, 1);
    assert!(renderer.backend().composites().is_empty());
}

#[test]
fn test_multi_pass_without_lights_renders_once() {
    let mut renderer = renderer(RendererConfiguration {
        multi_pass_lighting: true,
        ..config()
    });
    let stats = render(&mut renderer, &cube_and_glass());

    assert!(!stats.multi_pass);
    assert_eq!(stats.light_passes, 1);
    let labels = renderer.backend().pass_labels();
    assert!(labels.contains(&"frame"));
    assert!(!labels.contains(&"light pass"));
    assert!(!renderer
        .backend()
        .commands()
        .iter()
        .any(|c| matches!(c, Command::CopyFrameToAccumulation)));
}

#[test]
fn test_multi_pass_accumulates_lights() {
    let mut renderer = renderer(RendererConfiguration {
        multi_pass_lighting: true,
        depth_peeling: false,
        ..config()
    });
    let mut scene = cube_and_glass();
    add_light(&mut scene, "key", Light3D::directional(Vec3::new(-1.0, -1.0, -1.0)));
    add_light(&mut scene, "fill", Light3D::directional(Vec3::new(1.0, -0.5, -1.0)));
    scene.ambient = Vec3::splat(0.2);

    let stats = render(&mut renderer, &scene);
    assert!(stats.multi_pass);
    assert_eq!(stats.light_passes, 2);
    assert_eq!(stats.shadow_maps, 0);

    let backend = renderer.backend();
    let passes: Vec<_> = backend
        .passes()
        .into_iter()
        .filter(|pass| pass.label == "light pass")
        .collect();
    assert_eq!(passes.len(), 2);
    assert_eq!(passes[0].lights.len(), 1);
    assert_eq!(passes[0].clear_color, Some(Background::default().color));
    assert_eq!(passes[0].ambient, Vec3::splat(0.2));
    assert!(passes[0].base);
    assert_eq!(passes[1].clear_color, Some(Vec4::ZERO));
    assert_eq!(passes[1].ambient, Vec3::ZERO);
    assert!(!passes[1].base);

    let copies = backend
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::CopyFrameToAccumulation))
        .count();
    assert_eq!(copies, 1);
    assert_eq!(
        backend.composites(),
        vec![(CompositeSource::Accumulation, CompositeMode::Additive)]
    );
    assert!(backend
        .draws()
        .iter()
        .filter_map(|draw| draw.program.as_deref())
        .all(|label| label.contains("multi")));
}

#[test]
fn test_shadow_pass_culls_front_faces() {
    let mut renderer = renderer(config());
    let mut scene = Scene::new();
    scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube())));
    scene.add(
        ContentNode::new(
            "floor",
            Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0)),
            Node3D::object(Object3D::colored_quad(4.0, 4.0, Vec4::ONE)),
        )
        .with_shadows(false),
    );
    add_light(
        &mut scene,
        "sun",
        Light3D::directional(Vec3::new(0.3, 0.2, -1.0)).with_shadows(true),
    );

    let stats = render(&mut renderer, &scene);
    // A shadow casting light switches to multi-pass rendering.
    assert!(stats.multi_pass);
    assert_eq!(stats.shadow_maps, 1);

    let shadow = draws_per_pass(renderer.backend(), "shadow map");
    assert_eq!(shadow.len(), 1);
    // The floor does not cast shadows.
    assert_eq!(shadow[0].len(), 1);
    assert_eq!(shadow[0][0].cull, Some(CullFace::Front));
    assert_eq!(shadow[0][0].program, None);

    let light = renderer
        .backend()
        .passes()
        .into_iter()
        .find(|pass| pass.label == "light pass")
        .unwrap();
    assert!(light.shadow.is_some());
    let lit = draws_per_pass(renderer.backend(), "light pass");
    assert!(lit[0].iter().all(|draw| draw.cull != Some(CullFace::Front)));
    assert!(lit[0]
        .iter()
        .filter_map(|draw| draw.program.as_deref())
        .all(|label| label.contains("shadow")));
}

#[test]
fn test_shadow_debug_color_follows_configuration() {
    let mut scene = Scene::new();
    scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube())));
    add_light(
        &mut scene,
        "sun",
        Light3D::directional(Vec3::new(0.3, 0.2, -1.0)).with_shadows(true),
    );

    for debug_color in [false, true] {
        let mut renderer = renderer(RendererConfiguration {
            shadow_map_debug_color: debug_color,
            ..config()
        });
        assert_eq!(render(&mut renderer, &scene).shadow_maps, 1);

        let backend = renderer.backend();
        assert!(backend.commands().contains(&Command::EnsureShadowMap {
            size: 512,
            debug_color
        }));
        let shadow = backend
            .passes()
            .into_iter()
            .find(|pass| pass.label == "shadow map")
            .unwrap();
        let expected = debug_color.then_some(ColorTarget::ShadowDebug);
        assert_eq!(shadow.color, expected);
        // The casters still draw into the depth map either way.
        assert_eq!(draws_per_pass(backend, "shadow map")[0].len(), 1);
    }
}

#[test]
fn test_grid_drawn_in_last_light_pass() {
    let mut renderer = renderer(RendererConfiguration {
        multi_pass_lighting: true,
        depth_peeling: false,
        ..config()
    });
    let mut scene = cube_and_glass();
    add_light(&mut scene, "a", Light3D::directional(Vec3::NEG_Z));
    add_light(&mut scene, "b", Light3D::directional(Vec3::NEG_Y));
    let mut grid = Grid::default();
    grid.enabled = true;
    render_with(&mut renderer, &scene, &RenderStyle::default(), &grid);

    let commands = renderer.backend().commands();
    let last_pass = commands
        .iter()
        .rposition(|c| matches!(c, Command::BeginPass(pass) if pass.label == "light pass"))
        .unwrap();
    let line_positions: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Command::Lines { .. }))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(line_positions.len(), 3);
    assert!(line_positions.iter().all(|&index| index > last_pass));
}

#[test]
fn test_unlit_geometry_writes_color_once() {
    let mut renderer = renderer(RendererConfiguration {
        multi_pass_lighting: true,
        depth_peeling: false,
        ..config()
    });
    let mut scene = Scene::new();
    scene.add(ContentNode::new("cube", Mat4::IDENTITY, Node3D::object(cube())));
    add_light(&mut scene, "a", Light3D::directional(Vec3::NEG_Z));
    add_light(&mut scene, "b", Light3D::point());
    let style = RenderStyle {
        material_lighting_enabled: false,
        ..RenderStyle::default()
    };
    render_with(&mut renderer, &scene, &style, &Grid::default());

    let passes = draws_per_pass(renderer.backend(), "light pass");
    assert_eq!(passes.len(), 2);
    assert!(passes[0].iter().all(|draw| draw.color_write && !draw.lighting));
    // Later passes only write depth for unlit geometry.
    assert!(passes[1].iter().all(|draw| !draw.color_write));
}

#[test]
fn test_state_cache_reports_hits() {
    let mut renderer = renderer(RendererConfiguration {
        state_cache: StateCacheMode::Caching,
        ..config()
    });
    let stats = render(&mut renderer, &cube_and_glass());
    let cache = stats.state_cache.unwrap();
    assert!(cache.total > 0);
    assert!(cache.cached > 0);
    assert!(stats.draws > 0);
    assert_eq!(
        renderer.backend().state_change_count() as u64,
        cache.total - cache.cached
    );
}

#[test]
fn test_direct_state_forwards_everything() {
    let mut renderer = renderer(RendererConfiguration {
        state_cache: StateCacheMode::Direct,
        ..config()
    });
    let stats = render(&mut renderer, &cube_and_glass());
    let counts = stats.state_cache.unwrap();
    assert_eq!(counts.cached, 0);
    assert_eq!(renderer.backend().state_change_count() as u64, counts.total);
}
