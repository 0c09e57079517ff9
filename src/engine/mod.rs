//! Window execution over a sharded graph.
//!
//! A pass visits every shard as the *window*: that shard is loaded in full
//! as the memory shard (supplying in-edges and the window's own
//! out-edges), every other shard's sliding cursor streams the window's
//! remaining out-edges, the vertex program runs, and writebacks land with
//! the memory shard strictly last for its file.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::io::StripedIo;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::model::{EdgeValue, GraphVertex, Scheduler, VertexCapabilities};
use crate::shard::memory::MemoryShardOptions;
use crate::shard::sliding::SlidingShardOptions;
use crate::shard::{MemoryShard, ShardInterval, SlidingShard, load_intervals};

/// One user computation. `update` is called once per scheduled vertex per
/// pass, with edge values mutable in place through the vertex's edges.
pub trait VertexProgram<E: EdgeValue> {
    fn capabilities(&self) -> VertexCapabilities {
        VertexCapabilities::default()
    }

    fn update(&mut self, vertex: &mut GraphVertex<E>);
}

/// A preprocessed graph opened for execution.
pub struct ShardedGraph<E: EdgeValue> {
    base: String,
    intervals: Vec<ShardInterval>,
    io: StripedIo,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    sliders: Vec<SlidingShard<E>>,
    sliders_caps: Option<VertexCapabilities>,
    passes_run: u64,
}

impl<E: EdgeValue> ShardedGraph<E> {
    pub fn open(base: &str, nshards: usize, config: EngineConfig) -> Result<Self> {
        let intervals = load_intervals(base, nshards)?;
        let metrics = Arc::new(EngineMetrics::new());
        let io = StripedIo::new(config.io_stripes, Arc::clone(&metrics));
        info!(base = %base, nshards, "engine.open");
        Ok(Self {
            base: base.to_string(),
            intervals,
            io,
            config,
            metrics,
            sliders: Vec::new(),
            sliders_caps: None,
            passes_run: 0,
        })
    }

    pub fn num_shards(&self) -> usize {
        self.intervals.len()
    }

    pub fn num_vertices(&self) -> usize {
        match self.intervals.last() {
            Some(iv) => iv.hi as usize + 1,
            None => 0,
        }
    }

    pub fn intervals(&self) -> &[ShardInterval] {
        &self.intervals
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs one full pass of `program` over every window. The first pass
    /// builds each sliding shard's sparse index; later passes reuse the
    /// same cursors, fast-forwarding through it.
    pub fn run_pass(
        &mut self,
        program: &mut dyn VertexProgram<E>,
        scheduler: Option<&dyn Scheduler>,
    ) -> Result<()> {
        let caps = program.capabilities();
        self.prepare_sliders(caps)?;
        let record_index = self.passes_run == 0;
        let nshards = self.intervals.len();

        for window in 0..nshards {
            let interval = self.intervals[window];
            debug!(
                window,
                lo = interval.lo,
                hi = interval.hi,
                "engine.window.start"
            );

            // The window shard's sliding cursor shares bytes with the
            // memory shard image; its outstanding writes must land first.
            self.sliders[window].flush()?;

            let mut memshard = MemoryShard::<E>::open(
                self.io.clone(),
                &self.base,
                nshards,
                window,
                interval,
                MemoryShardOptions::default(),
            )?;

            let mut vertices: Vec<GraphVertex<E>> = (interval.lo..=interval.hi)
                .map(|vid| {
                    let mut vertex = GraphVertex::new(vid);
                    vertex.scheduled = scheduler.map_or(true, |s| s.is_scheduled(vid));
                    vertex
                })
                .collect();

            memshard.load_vertices(&mut vertices)?;
            for shard in 0..nshards {
                if shard != window {
                    self.sliders[shard].read_next_vertices(
                        &mut vertices,
                        interval.lo,
                        record_index,
                    )?;
                }
            }
            for shard in 0..nshards {
                if shard != window {
                    self.sliders[shard].complete_loads()?;
                }
            }

            for vertex in &mut vertices {
                if vertex.scheduled {
                    program.update(vertex);
                }
            }
            drop(vertices);

            // Window barrier: reposition the window shard's cursor past
            // its own sources, then write the memory image back.
            let (adj_off, vid, edata_off) = memshard.streaming_exit()?;
            self.sliders[window].set_offset(adj_off, vid, edata_off)?;
            memshard.commit()?;
            self.metrics.record_window();
        }

        for slider in &mut self.sliders {
            slider.flush()?;
        }
        self.passes_run += 1;
        info!(pass = self.passes_run, "engine.pass.done");
        Ok(())
    }

    fn prepare_sliders(&mut self, caps: VertexCapabilities) -> Result<()> {
        if self.sliders_caps == Some(caps) {
            for slider in &mut self.sliders {
                slider.set_offset(0, 0, 0)?;
            }
            return Ok(());
        }
        self.sliders.clear();
        let nshards = self.intervals.len();
        for (shard, &interval) in self.intervals.iter().enumerate() {
            self.sliders.push(SlidingShard::open(
                self.io.clone(),
                &self.base,
                nshards,
                shard,
                interval,
                &self.config,
                caps,
                SlidingShardOptions::default(),
            )?);
        }
        self.sliders_caps = Some(caps);
        Ok(())
    }
}

/// Convenience pass: apply a closure to every vertex.
pub struct ClosureProgram<E, F>
where
    E: EdgeValue,
    F: FnMut(&mut GraphVertex<E>),
{
    caps: VertexCapabilities,
    update: F,
    _edge: PhantomData<E>,
}

impl<E, F> ClosureProgram<E, F>
where
    E: EdgeValue,
    F: FnMut(&mut GraphVertex<E>),
{
    pub fn new(caps: VertexCapabilities, update: F) -> Self {
        Self {
            caps,
            update,
            _edge: PhantomData,
        }
    }
}

impl<E, F> VertexProgram<E> for ClosureProgram<E, F>
where
    E: EdgeValue,
    F: FnMut(&mut GraphVertex<E>),
{
    fn capabilities(&self) -> VertexCapabilities {
        self.caps
    }

    fn update(&mut self, vertex: &mut GraphVertex<E>) {
        (self.update)(vertex);
    }
}
