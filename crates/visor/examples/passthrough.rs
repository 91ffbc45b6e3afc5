//! Mirror the capture input to a locally attached display over DRM/KMS.
//!
//! Shows reason stubs (no signal, busy, unsupported format) when live
//! scanout is impossible. Needs DRM master, so stop any compositor first.

use std::time::Duration;

use visor::passthrough::Passthrough;
use visor_capture::DeviceConfig;
use visor_display::DisplayConfig;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (mut passthrough, _handle) = Passthrough::new(
        DeviceConfig::default(),
        DisplayConfig::default(),
        Duration::from_secs(1),
    );
    passthrough.run();
}
