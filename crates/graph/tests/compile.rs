//! Render graph scheduling tests against the public API.
//!
//! These cover the declaration layer and the device-free part of compile
//! (culling + ordering); barrier and aliasing details are unit-tested next
//! to the planner.

use forge_gfx::vk;
use forge_graph::{BufferDesc, RenderGraph, ResourceId};

fn transient_buffer() -> BufferDesc {
    BufferDesc {
        size: 1024,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER,
    }
}

#[test]
fn dead_chain_is_culled() {
    // A writes R1; B reads R1 and writes R2; no consumer reads R2 and B has
    // no side effects: the whole chain is removed.
    let mut graph = RenderGraph::new();

    let mut r1 = None;
    graph.add_pass(
        "a",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| {
            r1 = Some(builder.create_buffer(
                "r1",
                transient_buffer(),
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ));
        },
        |_| Ok(()),
    );
    let r1 = r1.unwrap();
    graph.add_pass(
        "b",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| {
            builder.read(r1, vk::AccessFlags2::SHADER_STORAGE_READ);
            builder.create_buffer(
                "r2",
                transient_buffer(),
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            );
        },
        |_| Ok(()),
    );

    assert!(graph.schedule().unwrap().is_empty());
}

#[test]
fn side_effect_pass_keeps_producers_live() {
    let mut graph = RenderGraph::new();

    let mut r1 = None;
    let a = graph.add_pass(
        "a",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| {
            r1 = Some(builder.create_buffer(
                "r1",
                transient_buffer(),
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ));
        },
        |_| Ok(()),
    );
    let r1 = r1.unwrap();
    let b = graph.add_pass(
        "b",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        true,
        |builder| {
            builder.read(r1, vk::AccessFlags2::SHADER_STORAGE_READ);
        },
        |_| Ok(()),
    );

    assert_eq!(graph.schedule().unwrap(), vec![a, b]);
}

#[test]
fn writes_to_imported_resources_are_externally_observed() {
    // A pass writing the swapchain image stays live without an explicit
    // side-effect flag or in-graph reader.
    let mut graph = RenderGraph::new();
    let target = graph.import_image(
        "swapchain",
        vk::Image::null(),
        vk::ImageView::null(),
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::UNDEFINED,
        Some(vk::ImageLayout::PRESENT_SRC_KHR),
    );
    let forward = graph.add_pass(
        "forward",
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        false,
        |builder| {
            builder.write(target, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        },
        |_| Ok(()),
    );

    assert_eq!(graph.schedule().unwrap(), vec![forward]);
}

#[test]
fn schedule_is_a_topological_sort_of_dependencies() {
    // gbuffer -> lighting -> post, declared with an unrelated pass in
    // between; every emitted order must respect the data flow.
    let mut graph = RenderGraph::new();
    let external = graph.import_buffer("readback", vk::Buffer::null());

    let mut gbuffer_out = None;
    let gbuffer = graph.add_pass(
        "gbuffer",
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        false,
        |builder| {
            gbuffer_out = Some(builder.create_buffer(
                "gbuffer-data",
                transient_buffer(),
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ));
        },
        |_| Ok(()),
    );
    let gbuffer_out = gbuffer_out.unwrap();

    let unrelated = graph.add_pass(
        "unrelated",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        true,
        |_| {},
        |_| Ok(()),
    );

    let mut lit = None;
    let lighting = graph.add_pass(
        "lighting",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| {
            builder.read(gbuffer_out, vk::AccessFlags2::SHADER_STORAGE_READ);
            lit = Some(builder.create_buffer(
                "lit",
                transient_buffer(),
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ));
        },
        |_| Ok(()),
    );
    let lit = lit.unwrap();

    let post = graph.add_pass(
        "post",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| {
            builder.read(lit, vk::AccessFlags2::SHADER_STORAGE_READ);
            builder.write(external, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        },
        |_| Ok(()),
    );

    let order = graph.schedule().unwrap();
    let pos = |id| order.iter().position(|&p| p == id).unwrap();
    assert_eq!(order.len(), 4);
    assert!(pos(gbuffer) < pos(lighting));
    assert!(pos(lighting) < pos(post));
    let _ = unrelated;
}

#[test]
fn writes_bump_resource_versions() {
    let mut graph = RenderGraph::new();
    let buffer = graph.import_buffer("history", vk::Buffer::null());
    assert_eq!(graph.resource_version(buffer), 0);

    let id: ResourceId = buffer;
    graph.add_pass(
        "w1",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| builder.write(id, vk::AccessFlags2::SHADER_STORAGE_WRITE),
        |_| Ok(()),
    );
    assert_eq!(graph.resource_version(buffer), 1);

    graph.add_pass(
        "w2",
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        false,
        |builder| builder.write(id, vk::AccessFlags2::SHADER_STORAGE_WRITE),
        |_| Ok(()),
    );
    assert_eq!(graph.resource_version(buffer), 2);
}
