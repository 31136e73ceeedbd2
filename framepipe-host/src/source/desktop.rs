//! DXGI Desktop Duplication frame source for Windows.
//!
//! Uses the Direct3D 11 Desktop Duplication API to obtain the composed
//! desktop image with minimal latency.
//!
//! # Platform
//!
//! This module is **Windows-only**. On other platforms the type is still
//! defined but [`DesktopSource::open`] fails, which makes `start()` fail
//! with an initialization error.

use std::time::Duration;

use framepipe_core::{FrameSource, PipelineError, RawFrame, Result};

/// Desktop-duplication frame source.
///
/// Wraps the `IDXGIOutputDuplication` pipeline:
///
/// 1. Create a D3D11 device.
/// 2. Enumerate outputs and duplicate the target monitor.
/// 3. Create a CPU-readable staging texture.
/// 4. On each [`acquire`](FrameSource::acquire):
///    - `AcquireNextFrame` (blocks up to the timeout).
///    - Copy the desktop texture to the staging texture.
///    - Map, copy rows into a `Vec<u8>`, unmap, release.
///
/// If the duplication is lost (mode change, secure desktop) the next
/// call rebuilds it on the same monitor, at whatever size the desktop now
/// has; later frames carry that size.
pub struct DesktopSource {
    width: u32,
    height: u32,
    monitor_index: u32,

    #[cfg(target_os = "windows")]
    device: windows::Win32::Graphics::Direct3D11::ID3D11Device,
    #[cfg(target_os = "windows")]
    context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    #[cfg(target_os = "windows")]
    duplication: windows::Win32::Graphics::Dxgi::IDXGIOutputDuplication,
    #[cfg(target_os = "windows")]
    staging: windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
}

impl DesktopSource {
    /// Desktop width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Desktop height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn monitor_index(&self) -> u32 {
        self.monitor_index
    }
}

// ── Windows implementation ───────────────────────────────────────

// SAFETY: the D3D11 device is free-threaded; the immediate context and
// the duplication are only ever touched by the thread that owns the
// source, which is one thread at a time.
#[cfg(target_os = "windows")]
unsafe impl Send for DesktopSource {}

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use framepipe_core::PixelFormat;
    use tracing::{info, warn};
    use windows::{
        Win32::Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::*,
            Dxgi::{Common::*, *},
        },
        core::Interface,
    };

    fn dxgi_error(what: &str, e: windows::core::Error) -> PipelineError {
        PipelineError::Initialization(format!("{what} failed: {e}"))
    }

    impl DesktopSource {
        /// Open the duplication for monitor `monitor_index` (0 = primary).
        pub fn open(monitor_index: u32) -> Result<Self> {
            let source = unsafe { Self::init_dxgi(monitor_index)? };
            info!(
                monitor = monitor_index,
                width = source.width,
                height = source.height,
                "desktop duplication initialised"
            );
            Ok(source)
        }

        unsafe fn init_dxgi(monitor_index: u32) -> Result<Self> {
            // 1. Device + immediate context.
            let mut device = None;
            let mut context = None;
            unsafe {
                D3D11CreateDevice(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
                .map_err(|e| dxgi_error("D3D11CreateDevice", e))?;
            }
            let device = device
                .ok_or_else(|| PipelineError::Initialization("D3D11 device is None".into()))?;
            let context = context
                .ok_or_else(|| PipelineError::Initialization("D3D11 context is None".into()))?;

            // 2. Device → Adapter → Output.
            let dxgi_device: IDXGIDevice = device
                .cast()
                .map_err(|e| dxgi_error("cast to IDXGIDevice", e))?;
            let adapter = unsafe { dxgi_device.GetAdapter() }
                .map_err(|e| dxgi_error("GetAdapter", e))?;
            let output: IDXGIOutput = unsafe { adapter.EnumOutputs(monitor_index) }
                .map_err(|e| dxgi_error(&format!("EnumOutputs({monitor_index})"), e))?;

            // 3. Duplicate.
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| dxgi_error("cast to IDXGIOutput1", e))?;
            let duplication = unsafe { output1.DuplicateOutput(&device) }
                .map_err(|e| dxgi_error("DuplicateOutput", e))?;

            let desc = unsafe { duplication.GetDesc() };
            let width = desc.ModeDesc.Width;
            let height = desc.ModeDesc.Height;

            // 4. CPU-readable staging texture.
            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging = None;
            unsafe { device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
                .map_err(|e| dxgi_error("CreateTexture2D (staging)", e))?;
            let staging = staging
                .ok_or_else(|| PipelineError::Initialization("staging texture is None".into()))?;

            Ok(Self {
                width,
                height,
                monitor_index,
                device,
                context,
                duplication,
                staging,
            })
        }

        unsafe fn acquire_inner(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
            let timeout_ms = timeout.as_millis().min(u128::from(u32::MAX)) as u32;
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;

            match unsafe {
                self.duplication
                    .AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource)
            } {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                    warn!("desktop duplication lost; reinitialising");
                    *self = unsafe { Self::init_dxgi(self.monitor_index)? };
                    return Ok(None);
                }
                Err(e) => {
                    return Err(PipelineError::Other(format!("AcquireNextFrame failed: {e}")));
                }
            }

            let resource = resource.ok_or_else(|| {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                PipelineError::Other("acquired resource is None".into())
            })?;
            let texture: ID3D11Texture2D = resource.cast().map_err(|e| {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                PipelineError::Other(format!("cast to ID3D11Texture2D failed: {e}"))
            })?;

            unsafe { self.context.CopyResource(&self.staging, &texture) };
            // Release the DXGI frame as early as possible.
            let _ = unsafe { self.duplication.ReleaseFrame() };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            }
            .map_err(|e| PipelineError::Other(format!("Map failed: {e}")))?;

            let stride = mapped.RowPitch;
            let total = stride as usize * self.height as usize;
            let data =
                unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, total) }.to_vec();
            unsafe { self.context.Unmap(&self.staging, 0) };

            Ok(Some(RawFrame {
                width: self.width,
                height: self.height,
                stride,
                format: PixelFormat::Bgra8,
                data,
                timestamp_us: 0,
            }))
        }
    }

    impl FrameSource for DesktopSource {
        fn acquire(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
            unsafe { self.acquire_inner(timeout) }
        }

        fn name(&self) -> &str {
            "dxgi-desktop"
        }
    }
}

// ── Non-Windows stub ─────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
impl DesktopSource {
    /// DXGI is only available on Windows.
    pub fn open(_monitor_index: u32) -> Result<Self> {
        Err(PipelineError::Initialization(
            "DXGI Desktop Duplication is only available on Windows".into(),
        ))
    }
}

#[cfg(not(target_os = "windows"))]
impl FrameSource for DesktopSource {
    fn acquire(&mut self, _timeout: Duration) -> Result<Option<RawFrame>> {
        Err(PipelineError::Other("not supported on this platform".into()))
    }

    fn name(&self) -> &str {
        "dxgi-desktop"
    }
}
