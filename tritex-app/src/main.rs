#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod renderer;
mod scene;
mod texture;

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use renderer::{Renderer, RendererConfig, window_extent};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use tritex_vk::{
    ash::vk,
    instance::{Instance, InstanceExtensions},
    log::VulkanLogLevel,
    swapchain::PresentFallback,
};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliPresentFallback {
    /// IMMEDIATE, then FIFO. May tear.
    #[default]
    Immediate,
    Fifo,
}

impl From<CliPresentFallback> for PresentFallback {
    fn from(value: CliPresentFallback) -> Self {
        match value {
            CliPresentFallback::Immediate => PresentFallback::Immediate,
            CliPresentFallback::Fifo => PresentFallback::Fifo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliSamples {
    #[default]
    #[value(name = "1")]
    X1,
    #[value(name = "2")]
    X2,
    #[value(name = "4")]
    X4,
    #[value(name = "8")]
    X8,
}

impl From<CliSamples> for vk::SampleCountFlags {
    fn from(value: CliSamples) -> Self {
        match value {
            CliSamples::X1 => vk::SampleCountFlags::TYPE_1,
            CliSamples::X2 => vk::SampleCountFlags::TYPE_2,
            CliSamples::X4 => vk::SampleCountFlags::TYPE_4,
            CliSamples::X8 => vk::SampleCountFlags::TYPE_8,
        }
    }
}

/// Draw a textured triangle.
#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    /// EnvFilter directives for the console, e.g. `tritex_vk=debug`.
    /// Overrides --tracing-log-level.
    #[arg(long)]
    log_filter: Option<String>,
    /// Enable validation and forward its messages at this level.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// Present mode when MAILBOX is unavailable.
    #[arg(long, default_value = "immediate")]
    present_fallback: CliPresentFallback,
    /// RGBA texture to sample. A checkerboard is used when absent.
    #[arg(long)]
    texture: Option<PathBuf>,
    /// SPIR-V module with `vertMain` and `fragMain`. Defaults to
    /// `shaders/triangle.spv` beside the executable.
    #[arg(long)]
    shader: Option<PathBuf>,
    #[arg(long, default_value_t = 1600)]
    width: u32,
    #[arg(long, default_value_t = 900)]
    height: u32,
    /// Rasterization samples, clamped to what the adapter supports.
    #[arg(long, default_value = "1")]
    samples: CliSamples,
}

impl CliArgs {
    fn renderer_config(&self) -> eyre::Result<RendererConfig> {
        let shader_path = match &self.shader {
            Some(path) => path.clone(),
            None => {
                let exe = std::env::current_exe()?;
                exe.parent()
                    .map(|dir| dir.join("shaders").join("triangle.spv"))
                    .ok_or_else(|| eyre::eyre!("Executable {} has no parent", exe.display()))?
            }
        };
        Ok(RendererConfig {
            shader_path,
            texture_path: self.texture.clone(),
            present_fallback: self.present_fallback.into(),
            samples: self.samples.into(),
        })
    }
}

fn init_tracing(cli_args: &CliArgs) -> eyre::Result<()> {
    if cli_args.tracing_log_level == TracingLogLevel::Off && cli_args.log_filter.is_none() {
        return Ok(());
    }

    let app_dirs = directories::ProjectDirs::from("", "tritex", "tritex-app");
    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let mut log_file_path = log_dir.clone();
    log_file_path.push("log-file");
    log_file_path.set_extension("txt");
    let log_file = File::create(&log_file_path)?;
    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    println!("log_file_path: {}", log_file_path.display());
    println!("cli_args: {:#?}", cli_args);

    let filter = match &cli_args.log_filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::default().add_directive(
            tracing_subscriber::filter::LevelFilter::from_level(
                cli_args.tracing_log_level.into(),
            )
            .into(),
        ),
    };
    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    tracing_subscriber::registry()
        .with(stdout_log.with_filter(filter).and_then(file_log))
        .init();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();
    init_tracing(&cli_args)?;
    let config = cli_args.renderer_config()?;

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    //SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let instance = Arc::new(unsafe {
        Instance::new(
            "tritex-app",
            cli_args.graphics_debug_level.map(Into::into),
            Some(&event_loop),
            InstanceExtensions { surface: true },
        )
    }?);

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        instance,
        config,
        window_size: LogicalSize {
            width: cli_args.width,
            height: cli_args.height,
        },
    })));

    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;

    match app.0 {
        Some(App::Exiting(ExitingState { error: Some(e) })) => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Suspended(SuspendedState),
    Exiting(ExitingState),
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    config: RendererConfig,
    window_size: LogicalSize<u32>,
}
#[derive(Debug)]
struct RunningState {
    win: Arc<WinitWindow>,
    renderer: Renderer,
}
#[derive(Debug)]
struct SuspendedState {
    win: Arc<WinitWindow>,
    renderer: Renderer,
}
/// Holds the error that ended the app, if any, for `main` to return.
#[derive(Debug)]
struct ExitingState {
    error: Option<eyre::Report>,
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(initializing_state) = self.take_initializing() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let win = match event_loop.create_window(
                WindowAttributes::default()
                    .with_title("tritex")
                    .with_inner_size(initializing_state.window_size),
            ) {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    tracing::error!("Error while creating window: {}", e);
                    self.transition_to_exiting("Initializing", event_loop, Some(e.into()));
                    return;
                }
            };
            let renderer = match Renderer::new(
                &initializing_state.instance,
                Arc::clone(&win),
                &initializing_state.config,
            ) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Error while creating renderer: {:#}", e);
                    self.transition_to_exiting("Initializing", event_loop, Some(e));
                    return;
                }
            };
            tracing::debug!("State transition: Initializing -> Running");
            self.set_running(RunningState { win, renderer });
        } else if let Some(suspended_state) = self.take_suspended() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let SuspendedState { win, mut renderer } = suspended_state;
            if let Err(e) = renderer.resume() {
                tracing::error!("Error while resuming renderer: {:#}", e);
                self.transition_to_exiting("Suspended", event_loop, Some(e));
                return;
            }
            tracing::debug!("State transition: Suspended -> Running");
            self.set_running(RunningState { win, renderer });
        } else if self.is_exiting() {
            tracing::warn!("resumed() called while in Exiting state");
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(running_state) = self.take_running() {
            event_loop.set_control_flow(ControlFlow::Wait);
            let RunningState { win, mut renderer } = running_state;
            if let Err(e) = renderer.suspend() {
                tracing::error!("Error while suspending renderer: {:#}", e);
                self.transition_to_exiting("Running", event_loop, Some(e));
                return;
            }
            tracing::debug!("State transition: Running -> Suspended");
            self.set_suspended(SuspendedState { win, renderer });
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running_state) = self.as_running()
            && running_state.renderer.can_render()
        {
            running_state.win.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        window_event: WindowEvent,
    ) {
        assert!(self.0.is_some());
        if !self.is_running_window(window_id) {
            return;
        }

        if matches!(&window_event, WindowEvent::CloseRequested) {
            tracing::trace!("Close window request received for window");
            self.exit_from_running(event_loop, None);
            return;
        }

        let result = match &window_event {
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                let Some(running_state) = self.as_running_mut() else {
                    return;
                };
                let extent = window_extent(&running_state.win);
                running_state.renderer.resize(extent)
            }
            WindowEvent::RedrawRequested => {
                let Some(running_state) = self.as_running_mut() else {
                    return;
                };
                running_state.renderer.render()
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::error!("Error while handling {:?}: {:#}", window_event, e);
            self.exit_from_running(event_loop, Some(e));
        }
    }
}

impl AppRunner {
    fn transition_to_exiting(
        &mut self,
        from_state: &'static str,
        event_loop: &ActiveEventLoop,
        error: Option<eyre::Report>,
    ) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.set_exiting(ExitingState { error });
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop, error: Option<eyre::Report>) {
        if let Some(running_state) = self.take_running() {
            // Tear down GPU objects before the window goes.
            drop(running_state);
            self.transition_to_exiting("Running", event_loop, error);
        } else {
            tracing::warn!("Requested Running -> Exiting transition while not in Running state");
            event_loop.exit();
        }
    }

    fn is_running_window(&self, window_id: WindowId) -> bool {
        if let Some(running_state) = self.as_running()
            && window_id == running_state.win.id()
        {
            true
        } else {
            false
        }
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Initializing(_))) {
            match self.0.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn take_running(&mut self) -> Option<RunningState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Running(_))) {
            match self.0.take() {
                Some(App::Running(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running(&self) -> Option<&RunningState> {
        assert!(self.0.is_some());
        match &self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        assert!(self.0.is_some());
        match &mut self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn set_running(&mut self, state: RunningState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Running(state));
    }

    fn take_suspended(&mut self) -> Option<SuspendedState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Suspended(_))) {
            match self.0.take() {
                Some(App::Suspended(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn set_suspended(&mut self, state: SuspendedState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Suspended(state));
    }

    fn is_exiting(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Exiting(_)))
    }

    fn set_exiting(&mut self, state: ExitingState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Exiting(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cli() {
        let args = CliArgs::try_parse_from(["tritex-app"]).unwrap();
        assert_eq!(args.tracing_log_level, TracingLogLevel::Error);
        assert_eq!(args.present_fallback, CliPresentFallback::Immediate);
        assert_eq!(args.samples, CliSamples::X1);
        assert_eq!((args.width, args.height), (1600, 900));
        assert!(args.texture.is_none());
    }

    #[test]
    fn sample_counts_parse_as_numbers() {
        let args = CliArgs::try_parse_from(["tritex-app", "--samples", "4"]).unwrap();
        assert_eq!(
            vk::SampleCountFlags::from(args.samples),
            vk::SampleCountFlags::TYPE_4
        );
        assert!(CliArgs::try_parse_from(["tritex-app", "--samples", "3"]).is_err());
    }

    #[test]
    fn explicit_shader_path_wins() {
        let args = CliArgs::try_parse_from([
            "tritex-app",
            "--shader",
            "x.spv",
            "--present-fallback",
            "fifo",
        ])
        .unwrap();
        let config = args.renderer_config().unwrap();
        assert_eq!(config.shader_path, PathBuf::from("x.spv"));
        assert_eq!(config.present_fallback, PresentFallback::Fifo);
    }
}
