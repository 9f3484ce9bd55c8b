use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

/// Family of benchmark-tool arguments a CPU binding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    Android,
    Lab,
}

impl Platform {
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Lab => "lab",
        }
    }

    /// Android jobs are pinned to a physical device; lab jobs run remotely.
    pub fn device_bound(&self) -> bool {
        matches!(self, Platform::Android)
    }
}

/// One benchmark inside a target, addressed by the tool's full name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Benchmark {
    pub short_name: String,
    pub name: String,
}

impl Benchmark {
    fn new(short_name: &str, name: &str) -> Self {
        Self {
            short_name: short_name.into(),
            name: name.into(),
        }
    }
}

/// A benchmark group the external tool can build and run as one unit.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub label: String,
    pub platforms: BTreeSet<Platform>,
    pub fixed_args: Vec<String>,
    pub benchmarks: Vec<Benchmark>,
}

/// A hardware/affinity binding: which device, and which cores on it.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub name: String,
    pub platform: Platform,
    /// User-facing device model; empty for platforms that are not device-bound.
    pub device: String,
    /// Affinity flag passed through to the tool; empty means omit.
    pub flag: String,
}

/// Optional build feature toggle; an empty flag means the default build.
#[derive(Debug, Clone)]
pub struct FeatureOption {
    pub name: String,
    pub flag: String,
}

/// Immutable key identifying one benchmark invocation.
#[derive(Debug, Clone)]
pub struct InvocationParams {
    pub reference: String,
    pub target: Target,
    pub cpu: Cpu,
    pub feature: FeatureOption,
}

/// Static declaration of everything the matrix is expanded from, plus the
/// argument-assembly rules for the external benchmark tool.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub common_args: Vec<String>,
    pub platform_args: BTreeMap<Platform, Vec<String>>,
    pub cpus: Vec<Cpu>,
    pub features: Vec<FeatureOption>,
    pub targets: Vec<Target>,
}

static BUILTIN: Lazy<Catalog> = Lazy::new(|| {
    let mut platform_args = BTreeMap::new();
    platform_args.insert(
        Platform::Android,
        vec![
            "--config=android_arm64".to_string(),
            "--device_mode=adb".to_string(),
        ],
    );
    platform_args.insert(
        Platform::Lab,
        vec!["--config=lab_x86".to_string(), "--remote".to_string()],
    );

    let all: BTreeSet<Platform> = [Platform::Android, Platform::Lab].into();
    let android_only: BTreeSet<Platform> = [Platform::Android].into();

    Catalog {
        common_args: vec![
            "--metrics=CPU,Instructions,Cycles,CacheMisses,BranchMisses".to_string(),
        ],
        platform_args,
        cpus: vec![
            Cpu {
                name: "P9a_big".into(),
                platform: Platform::Android,
                device: "Pixel_9a".into(),
                flag: "--cpu_affinity=80".into(),
            },
            Cpu {
                name: "P9a_mid".into(),
                platform: Platform::Android,
                device: "Pixel_9a".into(),
                flag: "--cpu_affinity=70".into(),
            },
            Cpu {
                name: "mokey_little".into(),
                platform: Platform::Android,
                device: "mokey".into(),
                flag: "--cpu_affinity=01".into(),
            },
            Cpu {
                name: "lab_skylake".into(),
                platform: Platform::Lab,
                device: String::new(),
                flag: String::new(),
            },
        ],
        features: vec![
            FeatureOption {
                name: "default".into(),
                flag: String::new(),
            },
            FeatureOption {
                name: "fasttable".into(),
                flag: "--features=fasttable".into(),
            },
        ],
        targets: vec![
            Target {
                name: "descriptor_parse".into(),
                label: "//benchmarks:parse_descriptor".into(),
                platforms: all.clone(),
                fixed_args: vec!["--filter=BM_Parse".into()],
                benchmarks: vec![
                    Benchmark::new("ArenaParse", "BM_Parse_FileDesc_WithArena"),
                    Benchmark::new("InitialBlock", "BM_Parse_FileDesc_WithInitialBlock"),
                ],
            },
            Target {
                name: "descriptor_serialize".into(),
                label: "//benchmarks:serialize_descriptor".into(),
                platforms: android_only,
                fixed_args: vec!["--filter=BM_Serialize".into()],
                benchmarks: vec![Benchmark::new("Serialize", "BM_Serialize_FileDesc")],
            },
            Target {
                name: "arena".into(),
                label: "//benchmarks:arena".into(),
                platforms: all,
                fixed_args: vec!["--filter=BM_Arena".into()],
                benchmarks: vec![
                    Benchmark::new("OneAlloc", "BM_ArenaOneAlloc"),
                    Benchmark::new("InitialBlock", "BM_ArenaInitialBlockOneAlloc"),
                ],
            },
        ],
    }
});

impl Catalog {
    /// The compiled-in benchmark matrix declaration.
    pub fn builtin() -> &'static Catalog {
        &BUILTIN
    }

    /// Assemble the tool's argument vector for one invocation. Order is
    /// load-bearing: reference, common args, platform args, CPU affinity,
    /// feature flag, target fixed args, target label last.
    pub fn argv_for(&self, params: &InvocationParams) -> Result<Vec<String>> {
        let mut argv = vec![format!("--reference={}", params.reference)];
        argv.extend(self.common_args.iter().cloned());
        let platform_args = self
            .platform_args
            .get(&params.cpu.platform)
            .with_context(|| {
                format!(
                    "no benchmark-tool arguments registered for platform {}",
                    params.cpu.platform.label()
                )
            })?;
        argv.extend(platform_args.iter().cloned());
        if !params.cpu.flag.is_empty() {
            argv.push(params.cpu.flag.clone());
        }
        if !params.feature.flag.is_empty() {
            argv.push(params.feature.flag.clone());
        }
        argv.extend(params.target.fixed_args.iter().cloned());
        argv.push(params.target.label.clone());
        Ok(argv)
    }

    /// Raw-log filename for one invocation; unique across the matrix because
    /// (target, cpu, feature) is the matrix key.
    pub fn output_filename_for(params: &InvocationParams) -> String {
        format!(
            "{}-{}-{}.txt",
            params.target.name, params.cpu.name, params.feature.name
        )
    }
}
