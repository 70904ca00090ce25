//! Per-frame GPU timing.
//!
//! Each in-flight frame owns a [`FrameProfiler`] with a timestamp query
//! pool. The render graph opens a scope around every pass; results are read
//! back once the frame's fence has signaled and logged under the
//! `gfx::profiler` target.

use std::sync::Arc;

use ash::vk;
use tracing::trace;

use crate::device::Device;
use crate::error::GfxResult;

/// Maximum number of timed scopes per frame.
const MAX_SCOPES: u32 = 64;

/// An open timing scope; pass it back to [`FrameProfiler::end_scope`].
#[must_use]
pub struct ScopeToken {
    begin_query: u32,
}

struct Scope {
    name: String,
    begin_query: u32,
    end_query: u32,
}

/// GPU timestamp profiler for one in-flight frame.
pub struct FrameProfiler {
    device: Arc<Device>,
    query_pool: vk::QueryPool,
    timestamp_period: f32,
    scopes: Vec<Scope>,
    next_query: u32,
}

impl FrameProfiler {
    pub fn new(device: Arc<Device>) -> GfxResult<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(MAX_SCOPES * 2);
        let query_pool = unsafe { device.handle().create_query_pool(&create_info, None)? };
        // Queries start in an undefined state; host reset brings the whole
        // pool to unavailable (host_query_reset is enabled on the device).
        unsafe {
            device
                .handle()
                .reset_query_pool(query_pool, 0, MAX_SCOPES * 2)
        };

        let timestamp_period = device.timestamp_period();

        Ok(Self {
            device,
            query_pool,
            timestamp_period,
            scopes: Vec::new(),
            next_query: 0,
        })
    }

    /// Opens a timing scope by writing a begin timestamp.
    ///
    /// Returns `None` when the frame ran out of scope slots; the caller
    /// simply skips the end write in that case.
    pub fn begin_scope(&mut self, cmd: vk::CommandBuffer, name: &str) -> Option<ScopeToken> {
        if self.next_query + 2 > MAX_SCOPES * 2 {
            return None;
        }
        let begin_query = self.next_query;
        self.next_query += 2;
        unsafe {
            self.device.handle().cmd_write_timestamp2(
                cmd,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                self.query_pool,
                begin_query,
            );
        }
        self.scopes.push(Scope {
            name: name.to_owned(),
            begin_query,
            end_query: begin_query + 1,
        });
        Some(ScopeToken { begin_query })
    }

    /// Closes a timing scope by writing its end timestamp.
    pub fn end_scope(&mut self, cmd: vk::CommandBuffer, token: ScopeToken) {
        unsafe {
            self.device.handle().cmd_write_timestamp2(
                cmd,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                self.query_pool,
                token.begin_query + 1,
            );
        }
    }

    /// Reads back and logs the previous frame's timings, then resets the
    /// pool for reuse.
    ///
    /// Must only be called after the frame's render fence has signaled, so
    /// all written timestamps are available.
    pub fn collect(&mut self) -> GfxResult<()> {
        if self.scopes.is_empty() {
            return Ok(());
        }

        let mut results = vec![0u64; self.next_query as usize];
        unsafe {
            self.device.handle().get_query_pool_results(
                self.query_pool,
                0,
                &mut results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }

        for scope in &self.scopes {
            let begin = results[scope.begin_query as usize];
            let end = results[scope.end_query as usize];
            let millis =
                end.saturating_sub(begin) as f64 * self.timestamp_period as f64 / 1_000_000.0;
            trace!(target: "gfx::profiler", "{}: {:.3} ms", scope.name, millis);
        }

        self.scopes.clear();
        unsafe {
            self.device
                .handle()
                .reset_query_pool(self.query_pool, 0, self.next_query)
        };
        self.next_query = 0;
        Ok(())
    }
}

impl Drop for FrameProfiler {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_query_pool(self.query_pool, None);
        }
    }
}
