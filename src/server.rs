//! Server launcher

use std::{io, path::PathBuf, sync::Arc};

use log::info;

use crate::{config::Config, manager::PortManager};

/// Start a listener for every configured port, then keep serving reload
/// requests until the process is terminated
pub async fn run(config: Config, config_path: Option<PathBuf>, udp_enabled: bool) -> io::Result<()> {
    let manager = Arc::new(PortManager::new(&config, udp_enabled));
    manager.update_from_config(&config);

    wait_reload_signal(manager, config_path).await
}

/// Reload the configuration file on every SIGHUP. A file that fails to parse
/// leaves the running configuration untouched.
#[cfg(unix)]
async fn wait_reload_signal(manager: Arc<PortManager>, config_path: Option<PathBuf>) -> io::Result<()> {
    use log::error;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;

    while sighup.recv().await.is_some() {
        info!("updating password");

        let path = match config_path {
            Some(ref path) => path,
            None => {
                error!("no configuration file to reload");
                continue;
            }
        };

        let mut config = match Config::load_from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("error parsing config file {} to update password: {}", path.display(), err);
                continue;
            }
        };
        config.unify_port_password();

        manager.update_from_config(&config);
        info!("password updated");
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_reload_signal(_manager: Arc<PortManager>, _config_path: Option<PathBuf>) -> io::Result<()> {
    futures::future::pending().await
}
