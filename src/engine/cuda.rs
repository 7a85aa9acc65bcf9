use std::ffi::{c_char, CStr, CString};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cudarc::{
    driver::{sys::CUdevice_attribute_enum, CudaContext, CudaFunction, CudaSlice, CudaStream,
             DriverError, LaunchConfig, PushKernelArg},
    nvrtc::{result as nvrtc_result, Ptx},
};
use log::info;

use poc_spec::{LANE, PLOT_SIZE};

use crate::engine::HashEngine;

const KERNEL_ENTRY: &str = "plot_kernel";

/// GPU batch hasher. Compiles the kernel source for the default device at
/// startup and keeps one device buffer of `global_work_size` nonces; each
/// `plot` call is one kernel launch plus a device-to-host copy.
pub struct CudaEngine {
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernel: CudaFunction,
    device_out: CudaSlice<u32>,
    global_work_size: usize,
    local_work_size: usize,
    step: i32,
}

impl CudaEngine {
    pub fn new(
        kernel_path: &Path,
        local_work_size: usize,
        global_work_size: usize,
        step: i32,
    ) -> Result<Self> {
        if global_work_size == 0 || global_work_size % LANE != 0 {
            bail!("global work size must be a positive multiple of {LANE}");
        }
        if local_work_size == 0 || global_work_size % local_work_size != 0 {
            bail!(
                "local work size {local_work_size} must divide global work size \
                 {global_work_size}"
            );
        }

        let ctx = CudaContext::new(0)
            .map_err(|err| anyhow!("failed to open CUDA context on device 0: {err:?}"))?;
        let stream = ctx.default_stream();
        let cc_major = ctx
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(|err| anyhow!("failed to query compute capability: {err:?}"))?;
        let cc_minor = ctx
            .attribute(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .map_err(|err| anyhow!("failed to query compute capability: {err:?}"))?;
        let device_name = ctx.name().unwrap_or_else(|_| "unknown".to_string());

        let source = fs::read_to_string(kernel_path)
            .with_context(|| format!("failed to read kernel source {}", kernel_path.display()))?;
        let options = vec![
            "--std=c++14".to_string(),
            "--restrict".to_string(),
            format!("--gpu-architecture=compute_{cc_major}{cc_minor}"),
        ];
        let ptx = compile_ptx_with_nvrtc(&source, "plot_kernel.cu", &options)?;
        let module = ctx
            .load_module(ptx)
            .map_err(|err| anyhow!("failed to load CUDA module: {err:?}"))?;
        let kernel = module
            .load_function(KERNEL_ENTRY)
            .map_err(|err| anyhow!("failed to load kernel function {KERNEL_ENTRY}: {err:?}"))?;

        let words = global_work_size * PLOT_SIZE / 4;
        let device_out = stream
            .alloc_zeros::<u32>(words)
            .map_err(|err| anyhow!("failed to allocate {words}-word device buffer: {err:?}"))?;

        info!(
            "cuda engine on `{device_name}` (sm_{cc_major}{cc_minor}), batch {global_work_size} \
             nonces, {} MiB device buffer",
            (words * 4) >> 20
        );

        Ok(Self {
            _ctx: ctx,
            stream,
            kernel,
            device_out,
            global_work_size,
            local_work_size,
            step,
        })
    }
}

impl HashEngine for CudaEngine {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn global_work_size(&self) -> usize {
        self.global_work_size
    }

    fn plot(
        &mut self,
        plot_id: u64,
        start_nonce: u64,
        nonces: usize,
        out: &mut [u8],
    ) -> Result<()> {
        if nonces > self.global_work_size {
            bail!(
                "batch of {nonces} nonces exceeds global work size {}",
                self.global_work_size
            );
        }
        if out.len() < self.global_work_size * PLOT_SIZE {
            bail!(
                "output buffer holds {} bytes, batch needs {}",
                out.len(),
                self.global_work_size * PLOT_SIZE
            );
        }
        let Ok(host_words) =
            bytemuck::try_cast_slice_mut::<u8, u32>(&mut out[..self.global_work_size * PLOT_SIZE])
        else {
            bail!("output buffer is not word aligned");
        };

        let cfg = LaunchConfig {
            grid_dim: ((self.global_work_size / self.local_work_size) as u32, 1, 1),
            block_dim: (self.local_work_size as u32, 1, 1),
            shared_mem_bytes: 0,
        };

        // Device loss here is fatal; the caller aborts the run.
        unsafe {
            let mut launch = self.stream.launch_builder(&self.kernel);
            launch
                .arg(&plot_id)
                .arg(&start_nonce)
                .arg(&self.step)
                .arg(&mut self.device_out);
            launch.launch(cfg).map_err(cuda_driver_err)?;
        }

        self.stream
            .memcpy_dtoh(&self.device_out, host_words)
            .map_err(cuda_driver_err)?;
        Ok(())
    }
}

fn cuda_driver_err(err: DriverError) -> anyhow::Error {
    anyhow!("CUDA driver error: {err:?}")
}

fn compile_ptx_with_nvrtc(source: &str, program_name: &str, options: &[String]) -> Result<Ptx> {
    let source_c = CString::new(source)
        .map_err(|_| anyhow!("CUDA kernel source contains interior NUL byte"))?;
    let program_name_c = CString::new(program_name)
        .map_err(|_| anyhow!("CUDA program name contains interior NUL byte"))?;

    let program = nvrtc_result::create_program(&source_c, Some(&program_name_c))
        .map_err(|err| anyhow!("nvrtcCreateProgram failed: {err:?}"))?;

    if let Err(err) = unsafe { nvrtc_result::compile_program(program, options) } {
        let build_log = unsafe { nvrtc_result::get_program_log(program).ok() }
            .map(|raw| nvrtc_log_to_string(&raw))
            .unwrap_or_default();
        let _ = unsafe { nvrtc_result::destroy_program(program) };
        if build_log.is_empty() {
            bail!("nvrtcCompileProgram failed: {err:?}");
        }
        bail!("nvrtcCompileProgram failed: {err:?}; build log: {build_log}");
    }

    let ptx = unsafe { nvrtc_result::get_ptx(program) }
        .map_err(|err| anyhow!("nvrtcGetPTX failed: {err:?}"))?;
    let ptx = nvrtc_log_to_string(&ptx);

    unsafe { nvrtc_result::destroy_program(program) }
        .map_err(|err| anyhow!("nvrtcDestroyProgram failed: {err:?}"))?;

    Ok(Ptx::from_src(ptx))
}

fn nvrtc_log_to_string(raw: &[c_char]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
