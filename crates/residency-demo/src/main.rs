//! Non-windowed simulation of a `TileUpdateManager` driving a single
//! streaming resource through cold load, steady state, and an evict-all,
//! using the in-process immediate fakes in place of a real GPU backend.
//! Exercises the public API end to end; the GPU command lists
//! `begin_frame`/`end_frame` return are logged rather than executed.

use std::sync::Arc;
use std::time::Duration;

use residency_protocol::{EngineConfig, FrameFenceCompleted, RenderFence};
use tile_residency::TileGridDims;
use tile_update_manager::TileUpdateManager;
use tile_uploader::fakes::{ImmediateBackend, ImmediateStreamer};
use tracing::info;

/// A camera closing in on a 4x4-tile surface: the desired mip drops one
/// level every few frames until it bottoms out at 0.
fn desired_mip_for_frame(frame: u64) -> u8 {
    let steps = frame / 3;
    3u8.saturating_sub(steps as u8)
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let config = EngineConfig::new(2);
    let manager = TileUpdateManager::new(
        config,
        Arc::new(ImmediateBackend::default()),
        Arc::new(ImmediateStreamer::default()),
    );

    let dims = TileGridDims::new(4, 4);
    let handle = manager.create_streaming_resource(dims, 4);
    info!(resource = handle.id().0, "streaming resource registered");

    let region_count = (dims.width_tiles * dims.height_tiles) as usize;
    let mut fence = 0u64;

    for frame in 0..24u64 {
        fence += 1;
        let desired = desired_mip_for_frame(frame);
        let feedback = FrameFenceCompleted(fence);

        let frame_output = manager.begin_frame();
        for command in &frame_output.pre_draw_commands {
            info!(?command, "pre-draw");
        }

        let buffer = tile_residency::FeedbackBuffer {
            render_fence: RenderFence(fence),
            regions: vec![desired; region_count],
        };
        manager.queue_feedback(handle.id(), buffer);

        manager.end_frame(feedback);

        if handle.take_needs_transition() {
            info!(resource = handle.id().0, "packed-mip bootstrap complete, resource is sampleable");
        }

        if manager.is_ready_to_sample(handle.id()) {
            let snapshot = manager.begin_frame();
            let region = snapshot.residency_buffer.regions[0];
            let bytes = &snapshot.residency_buffer.bytes[region.offset..region.offset + region.len];
            info!(frame, desired_mip = desired, min_mip_map = ?bytes, "residency state");
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    info!("requesting evict-all");
    manager.request_evict_all(handle.id());
    for _ in 0..8 {
        fence += 1;
        manager.end_frame(FrameFenceCompleted(fence));
        std::thread::sleep(Duration::from_millis(10));
    }

    manager.finish().expect("pipeline drains without a fatal error");
    info!("pipeline drained, exiting");
}
