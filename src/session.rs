use std::path::{Path, PathBuf};

use ort::{ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

pub(crate) const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

/// Input shape profile handed to TensorRT for engine building.
#[derive(Debug, Clone)]
#[cfg_attr(not(feature = "tensorrt"), allow(dead_code))]
pub(crate) struct ShapeProfile {
    pub min: String,
    pub max: String,
    pub opt: String,
}

#[derive(Debug, Clone)]
#[cfg_attr(not(feature = "tensorrt"), allow(dead_code))]
pub(crate) struct SessionOptions<'a> {
    pub threads: usize,
    pub execution_providers: &'a [ExecutionProvider],
    pub cache_path: Option<PathBuf>,
    pub profile: ShapeProfile,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf, profile: &ShapeProfile) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    TensorRTExecutionProvider::default()
        .with_profile_min_shapes(profile.min.clone())
        .with_profile_max_shapes(profile.max.clone())
        .with_profile_opt_shapes(profile.opt.clone())
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .with_builder_optimization_level(5)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    ort::CUDAExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    ort::CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    ort::DirectMLExecutionProvider::default().build()
}

#[instrument(level = "debug", skip(options))]
pub(crate) fn build_session(path: &Path, options: SessionOptions<'_>) -> ort::Result<Session> {
    #[cfg(feature = "directml")]
    let parallel = !options
        .execution_providers
        .contains(&ExecutionProvider::DirectML);
    #[cfg(not(feature = "directml"))]
    let parallel = true;

    #[cfg(feature = "tensorrt")]
    let cache_path = options.cache_path.clone().unwrap_or_else(|| {
        path.parent()
            .map(|it| it.join(".cache"))
            .unwrap_or_else(|| PathBuf::from(".cache"))
    });

    let providers = options.execution_providers.iter().filter_map(
        |provider| -> Option<ExecutionProviderDispatch> {
            match provider {
                ExecutionProvider::Default => None,
                #[cfg(feature = "tensorrt")]
                ExecutionProvider::TensorRT => {
                    Some(setup_tensorrt(cache_path.clone(), &options.profile))
                }
                #[cfg(feature = "coreml")]
                ExecutionProvider::CoreML => Some(setup_coreml()),
                #[cfg(feature = "cuda")]
                ExecutionProvider::Cuda => Some(setup_cuda()),
                #[cfg(feature = "directml")]
                ExecutionProvider::DirectML => Some(setup_directml()),
            }
        },
    );

    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_memory_pattern(parallel)?
        .with_parallel_execution(parallel)?
        .with_inter_threads(options.threads)?
        .with_intra_threads(options.threads)?
        .with_execution_providers(providers)?
        .commit_from_file(path)
}
