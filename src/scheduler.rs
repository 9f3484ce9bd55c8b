use std::{
    collections::{HashSet, VecDeque},
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, time};
use tracing::{info, warn};

use crate::{
    catalog::{Benchmark, Catalog, FeatureOption, InvocationParams, Target},
    environment::Environment,
    render,
    report::{Ipc, MetricTable},
    runner::{self, RunnerResult, RunnerSpec},
};

/// The metric columns filled into every rendered row, in column order.
const TABLE_METRICS: [&str; 4] = ["CPU", "Instructions", "CacheMisses", "BranchMisses"];

/// One row of the rendered table, owned by its invocation.
#[derive(Debug, Clone)]
pub struct ResultLine {
    pub benchmark: Benchmark,
    /// Row identity (benchmark + CPU), printed as the unpadded trailing column.
    pub header: String,
    /// Formatted value region; absent while unstarted or running.
    pub value: Option<String>,
}

/// Runtime state of one matrix entry. Mutated only by the scheduler loop.
#[derive(Debug)]
pub struct Invocation {
    pub params: InvocationParams,
    /// Queue key: device model for device-bound platforms, platform label otherwise.
    pub device: String,
    pub serial: Option<String>,
    pub output_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub raw_output: Option<String>,
    pub lines: Vec<ResultLine>,
}

/// A target and the invocations covering it across CPUs for one feature.
#[derive(Debug)]
pub struct InvocationGroup {
    pub target: Target,
    pub feature: FeatureOption,
    pub members: Vec<usize>,
}

#[derive(Debug)]
struct DeviceQueue {
    device: String,
    jobs: VecDeque<usize>,
}

/// Expands the benchmark matrix into per-device FIFO queues and drives them:
/// one job per device at a time, devices in parallel, completions delivered
/// over a single channel so only this loop ever touches invocation state.
#[derive(Debug)]
pub struct Scheduler {
    env: Environment,
    catalog: Catalog,
    benchy: PathBuf,
    invocations: Vec<Invocation>,
    groups: Vec<InvocationGroup>,
    queues: Vec<DeviceQueue>,
}

impl Scheduler {
    /// Phase 1: matrix expansion. Declared order is preserved everywhere:
    /// features, then targets, then CPUs. A device-bound CPU whose device
    /// is not connected is skipped with a warning; an empty matrix is fatal.
    pub fn new(
        env: Environment,
        catalog: Catalog,
        reference: &str,
        benchy: PathBuf,
    ) -> Result<Self> {
        let mut invocations = Vec::new();
        let mut groups = Vec::new();
        let mut queues: Vec<DeviceQueue> = Vec::new();
        let mut warned = HashSet::new();

        for feature in &catalog.features {
            for target in &catalog.targets {
                let mut members = Vec::new();
                for cpu in &catalog.cpus {
                    if !target.platforms.contains(&cpu.platform) {
                        continue;
                    }
                    let (device, serial) = if cpu.platform.device_bound() {
                        match env.devices.get(&cpu.device) {
                            Some(serial) => (cpu.device.clone(), Some(serial.clone())),
                            None => {
                                if warned.insert(cpu.name.clone()) {
                                    warn!(
                                        cpu = %cpu.name,
                                        device = %cpu.device,
                                        "device not connected; skipping CPU"
                                    );
                                }
                                continue;
                            }
                        }
                    } else {
                        (cpu.platform.label().to_string(), None)
                    };

                    let params = InvocationParams {
                        reference: reference.to_string(),
                        target: target.clone(),
                        cpu: cpu.clone(),
                        feature: feature.clone(),
                    };
                    let lines = target
                        .benchmarks
                        .iter()
                        .map(|benchmark| ResultLine {
                            benchmark: benchmark.clone(),
                            header: format!("{} ({})", benchmark.short_name, cpu.name),
                            value: None,
                        })
                        .collect();

                    let index = invocations.len();
                    invocations.push(Invocation {
                        output_path: env.output_dir.join(Catalog::output_filename_for(&params)),
                        scratch_dir: env.scratch_base.join(&device),
                        device: device.clone(),
                        serial,
                        params,
                        started_at: None,
                        finished_at: None,
                        raw_output: None,
                        lines,
                    });
                    members.push(index);
                    match queues.iter_mut().find(|queue| queue.device == device) {
                        Some(queue) => queue.jobs.push_back(index),
                        None => queues.push(DeviceQueue {
                            device,
                            jobs: VecDeque::from([index]),
                        }),
                    }
                }
                if !members.is_empty() {
                    groups.push(InvocationGroup {
                        target: target.clone(),
                        feature: feature.clone(),
                        members,
                    });
                }
            }
        }

        if invocations.is_empty() {
            bail!("no connected device matches any enabled benchmark target");
        }

        Ok(Self {
            env,
            catalog,
            benchy,
            invocations,
            groups,
            queues,
        })
    }

    /// Print the expanded matrix as resolved command lines without running.
    pub fn print_plan(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "raw logs: {}", self.env.output_dir.display())?;
        for group in &self.groups {
            for &index in &group.members {
                let invocation = &self.invocations[index];
                let argv = self.catalog.argv_for(&invocation.params)?;
                let mut rendered = String::new();
                if let Some(serial) = &invocation.serial {
                    rendered.push_str(&format!("ANDROID_SERIAL={serial} "));
                }
                rendered.push_str(&format!(
                    "{} --scratch_output_base={} {}",
                    self.benchy.display(),
                    invocation.scratch_dir.display(),
                    argv.join(" ")
                ));
                writeln!(out, "{rendered}")?;
            }
        }
        Ok(())
    }

    /// Phase 2: execution. Suspends on either a completion record or the
    /// 200 ms repaint tick; exits once every queue has drained, with one
    /// final repaint so the last frame is complete.
    pub async fn run(self) -> Result<()> {
        let mut stdout = io::stdout();
        self.run_with(&mut stdout).await
    }

    async fn run_with(mut self, out: &mut impl Write) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<RunnerResult>(self.queues.len().max(1));
        let mut active = 0usize;
        let heads: Vec<usize> = self
            .queues
            .iter()
            .filter_map(|queue| queue.jobs.front().copied())
            .collect();
        for index in heads {
            self.launch(index, &tx)?;
            active += 1;
        }
        info!(
            jobs = self.invocations.len(),
            devices = active,
            "benchmark matrix started"
        );

        let mut scrollback = 0usize;
        let mut ticker = time::interval(Duration::from_millis(200));
        while active > 0 {
            tokio::select! {
                Some(result) = rx.recv() => {
                    let queue_index = self.complete(result)?;
                    match self.queues[queue_index].jobs.front().copied() {
                        Some(next) => self.launch(next, &tx)?,
                        None => active -= 1,
                    }
                }
                _ = ticker.tick() => {
                    scrollback =
                        render::repaint(out, &self.groups, &self.invocations, scrollback, Utc::now())?;
                }
            }
        }
        render::repaint(out, &self.groups, &self.invocations, scrollback, Utc::now())?;
        Ok(())
    }

    fn launch(&mut self, index: usize, tx: &mpsc::Sender<RunnerResult>) -> Result<()> {
        let argv = self.catalog.argv_for(&self.invocations[index].params)?;
        let invocation = &mut self.invocations[index];
        invocation.started_at = Some(Utc::now());
        let spec = RunnerSpec {
            binary: self.benchy.clone(),
            device: invocation.device.clone(),
            argv,
            serial: invocation.serial.clone(),
            scratch_dir: invocation.scratch_dir.clone(),
            output_path: invocation.output_path.clone(),
        };
        tokio::spawn(runner::run(spec, tx.clone()));
        Ok(())
    }

    /// Consume one completion: stamp the head invocation, parse its output,
    /// fill its rows, and pop it from the device's queue. Returns the queue
    /// index so the caller can launch the next job or retire the device.
    fn complete(&mut self, result: RunnerResult) -> Result<usize> {
        let queue_index = self
            .queues
            .iter()
            .position(|queue| queue.device == result.device)
            .with_context(|| format!("completion for unknown device {}", result.device))?;
        let head = self.queues[queue_index]
            .jobs
            .front()
            .copied()
            .with_context(|| format!("completion for idle device {}", result.device))?;

        let (label, log) = {
            let invocation = &mut self.invocations[head];
            invocation.finished_at = Some(Utc::now());
            invocation.raw_output = Some(result.output.clone());
            (
                format!(
                    "{} on {} ({})",
                    invocation.params.target.name,
                    invocation.params.cpu.name,
                    invocation.params.feature.name
                ),
                invocation.output_path.clone(),
            )
        };

        if let Some(err) = result.error {
            return Err(err.context(format!(
                "benchmark run failed for {label} (log: {})",
                log.display()
            )));
        }

        let table = MetricTable::parse(&result.output).with_context(|| {
            format!(
                "unparsable benchmark output for {label} (log: {})",
                log.display()
            )
        })?;

        let invocation = &mut self.invocations[head];
        for line in &mut invocation.lines {
            let mut cells: [String; 4] = Default::default();
            for (slot, metric) in TABLE_METRICS.iter().enumerate() {
                let cell = table.cell(metric, &line.benchmark.name).with_context(|| {
                    format!(
                        "no {metric} cell for {} in {}",
                        line.benchmark.name,
                        log.display()
                    )
                })?;
                cells[slot] = cell.summary();
            }
            let ipc = table.ipc(&line.benchmark.name)?;
            line.value = Some(render::value_region(&cells, &Ipc::render(ipc)));
        }

        self.queues[queue_index].jobs.pop_front();
        Ok(queue_index)
    }
}
