//! Debugger wiring for function containers.

use tracing::info;

use crate::{
    descriptor::{DebugConfig, DebugIde, FunctionDescriptor},
    error::{Error, Result},
};

/// Env var the runtime images read debugger flags from.
pub const DEBUG_OPTIONS_ENV: &str = "DEBUG_OPTIONS";

/// Debugger command line flags for a runtime listening on `port`.
pub fn debug_options(runtime: &str, port: u16) -> Result<String> {
    let options = match runtime {
        "nodejs6" => format!("--debug-brk={port}"),
        "nodejs8" | "nodejs10" => format!("--inspect-brk=0.0.0.0:{port}"),
        "python2.7" | "python3" => format!("-m ptvsd --host 0.0.0.0 --port {port} --wait"),
        "java8" => format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,quiet=y,address={port}"
        ),
        "php7.2" => format!(
            "remote_enable=1 remote_autostart=1 remote_port={port} \
             remote_host=host.docker.internal"
        ),
        _ => {
            return Err(Error::UnsupportedRuntime {
                runtime: runtime.to_string(),
            })
        }
    };
    Ok(options)
}

fn vscode_launch_type(runtime: &str) -> &'static str {
    match runtime {
        "nodejs6" | "nodejs8" | "nodejs10" => "node",
        "python2.7" | "python3" => "python",
        "java8" => "java",
        _ => "php",
    }
}

/// Log how to attach the selected IDE to the debugger.
pub fn log_ide_tips(descriptor: &FunctionDescriptor, debug: &DebugConfig) {
    match debug.ide {
        DebugIde::None => {}
        DebugIde::Vscode => {
            let launch = serde_json::json!({
                "version": "0.2.0",
                "configurations": [{
                    "name": format!("fc/{}/{}", descriptor.service, descriptor.name),
                    "type": vscode_launch_type(&descriptor.runtime),
                    "request": "attach",
                    "address": "localhost",
                    "port": debug.port,
                    "localRoot": descriptor.code_uri,
                    "remoteRoot": "/code",
                }],
            });
            info!(
                service = %descriptor.service,
                function = %descriptor.name,
                launch = %launch,
                "Add this configuration to .vscode/launch.json, then attach the debugger"
            );
        }
        DebugIde::Pycharm => {
            let port = debug.port;
            info!(
                service = %descriptor.service,
                function = %descriptor.name,
                port,
                "Create a PyCharm remote debug configuration on localhost and map the \
                 code directory to /code"
            );
        }
    }
}
