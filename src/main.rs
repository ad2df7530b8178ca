//! vmview - remote VM display viewer

use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmview::backend::egl::EglDevice;
use vmview::backend::HardwareBackend;
use vmview::config::Config;
use vmview::protocol::ProtocolClient;
use vmview::window::{ViewerWindow, WindowEvent};
use vmview::{DisplayContext, DisplayError};
use vmview_proto::Channel;

const FRAME_INTERVAL: Duration = Duration::from_millis(16);

struct ViewerApp {
    window: ViewerWindow,
    protocol: ProtocolClient,
    display: DisplayContext,
    last_frame: Instant,
}

impl ViewerApp {
    async fn new(config: Config) -> Result<Self> {
        let socket = config.socket_path();
        let channel = Self::connect(&socket).await?;
        let protocol = ProtocolClient::spawn(channel)?;

        let window = ViewerWindow::new(&config.window).context("Failed to create viewer window")?;

        let hardware = if config.display.hardware_acceleration {
            match EglDevice::new(window.id()) {
                Ok(device) => Some(HardwareBackend::new(Box::new(device))),
                Err(e) => {
                    warn!("Hardware rendering unavailable, using software only: {}", e);
                    None
                }
            }
        } else {
            info!("Hardware rendering disabled by configuration");
            None
        };

        let display = DisplayContext::new(
            config.display.scale_config(),
            config.display.display_options(),
            window.size(),
            hardware,
        );

        Ok(Self {
            window,
            protocol,
            display,
            last_frame: Instant::now(),
        })
    }

    async fn connect(socket: &Path) -> Result<Channel> {
        info!("Connecting to display server at {:?}", socket);

        // Wait for the server socket to appear
        let mut retries = 100;
        while !socket.exists() && retries > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            retries -= 1;
        }

        let channel = Channel::connect(socket)
            .with_context(|| format!("Failed to connect to display server at {:?}", socket))?;
        info!("Connected to display server");
        Ok(channel)
    }

    fn handle_window_event(&mut self, event: WindowEvent) -> bool {
        match event {
            WindowEvent::Expose => self.display.request_redraw(),
            WindowEvent::Resized { width, height } => self.display.resize(width, height),
            WindowEvent::PointerEntered => self.display.set_pointer_grabbed(true),
            WindowEvent::PointerLeft => self.display.set_pointer_grabbed(false),
            WindowEvent::CloseRequested => {
                info!("Window closed");
                return false;
            }
        }
        true
    }

    /// One iteration of the main loop. Returns false when the viewer should exit.
    fn tick(&mut self) -> Result<bool> {
        while let Some(event) = self.protocol.try_recv_event() {
            if let Err(e) = self.display.handle_event(event) {
                warn!("Display event failed: {}", e);
            }
        }
        if self.protocol.is_disconnected() {
            info!("Display channel closed");
            return Ok(false);
        }

        for event in self.window.poll_events()? {
            if !self.handle_window_event(event) {
                return Ok(false);
            }
        }

        if self.display.has_pending_redraw() {
            let redraws = self.display.take_redraws();
            debug!("Repainting {} region(s)", redraws.len());
            match self.display.draw(&mut self.window) {
                Ok(()) => {}
                Err(DisplayError::Present(e)) => return Err(anyhow::anyhow!(e)),
                Err(e) => warn!("Repaint failed: {}", e),
            }
        }

        for message in self.display.take_outbound() {
            self.protocol.send(&message)?;
        }

        if let Some(fps) = self.display.stats_mut().poll_report() {
            debug!(
                "{:.1} fps ({} software, {} hardware frames total)",
                fps,
                self.display.stats().software_frames(),
                self.display.stats().hardware_frames()
            );
        }
        Ok(true)
    }

    async fn run(&mut self) -> Result<()> {
        while self.tick()? {
            // Throttle to ~60fps
            let elapsed = self.last_frame.elapsed();
            if elapsed < FRAME_INTERVAL {
                tokio::time::sleep(FRAME_INTERVAL - elapsed).await;
            }
            self.last_frame = Instant::now();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vmview=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vmview");

    let config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });

    let mut app = ViewerApp::new(config).await?;
    app.run().await?;

    info!("vmview exiting");
    Ok(())
}
