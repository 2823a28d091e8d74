//! Command dispatch: bridges CLI args to core subscriptions and RPC.

pub mod config_cmd;
pub mod history;
pub mod latest;
pub mod rpc;
pub mod util;
pub mod watch;

use telemux_core::ServiceConfig;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a server-bound command to the appropriate handler.
pub async fn dispatch(
    cmd: Command,
    config: &ServiceConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let auth = telemux_core::auth_provider(config)?;

    if let Command::Rpc(args) = cmd {
        let session = telemux_core::rpc_session(config, auth, Some(args.device_id))?;
        return rpc::handle(&session, args, global).await;
    }

    let service = telemux_core::connect(config, auth);
    let result = match cmd {
        Command::Watch(args) => watch::handle(&service, args, global).await,
        Command::History(args) => history::handle(&service, args, global).await,
        Command::Latest(args) => latest::handle(&service, args, global).await,
        // Config and Rpc are handled before the service starts
        Command::Config(_) | Command::Rpc(_) => Ok(()),
    };
    service.shutdown();
    result
}
