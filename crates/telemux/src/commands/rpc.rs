//! `telemux rpc`: one-way or two-way device command.

use serde_json::Value;
use tracing::debug;

use telemux_core::RpcSession;

use crate::cli::{GlobalOpts, RpcArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(session: &RpcSession, args: RpcArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let params: Value = match args.params.as_deref() {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(serde_json::Map::new()),
    };

    let response = if args.one_way {
        session
            .send_one_way(&args.method, params, args.rpc_timeout)
            .await?
    } else {
        session
            .send_two_way(&args.method, params, args.rpc_timeout)
            .await?
    };
    debug!(state = ?session.state(), "rpc finished");

    if !response.is_null() {
        output::print_output(&output::render_value(global.output, &response), global.quiet);
    }
    Ok(())
}
