//! dbus-dispatch-demo - example service built on dbus-dispatch.
//!
//! Exports a small counter interface and serves it until interrupted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zbus::fdo;
use zbus::zvariant::{OwnedValue, Value};

use dbus_dispatch::interface::{ArgInfo, MethodInfo, PropertyAccess, PropertyInfo};
use dbus_dispatch::message::error_names;
use dbus_dispatch::{
    remote, BusConnection, DispatchRule, Error, InterfaceInfo, InterfaceSkeleton,
    MethodInvocation, Result, SkeletonHandler, SkeletonServer,
};

const COUNTER_INTERFACE: &str = "org.dbusdispatch.Counter1";

static COUNTER_INFO: InterfaceInfo = InterfaceInfo {
    name: COUNTER_INTERFACE,
    methods: &[
        MethodInfo {
            name: "Increment",
            in_args: &[],
            out_args: &[ArgInfo { name: "value", signature: "u" }],
        },
        MethodInfo {
            name: "Reset",
            in_args: &[],
            out_args: &[],
        },
        MethodInfo {
            name: "Echo",
            in_args: &[ArgInfo { name: "text", signature: "s" }],
            out_args: &[ArgInfo { name: "text", signature: "s" }],
        },
    ],
    properties: &[
        PropertyInfo {
            name: "Value",
            signature: "u",
            access: PropertyAccess::ReadWrite,
        },
        PropertyInfo {
            name: "Label",
            signature: "s",
            access: PropertyAccess::Read,
        },
    ],
    signals: &[],
};

/// D-Bus method call dispatcher example service.
#[derive(Parser, Debug)]
#[command(name = "dbus-dispatch-demo")]
#[command(author, version, about, long_about = None)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIMESTAMP"), ")"))]
struct Args {
    /// D-Bus address to connect to.
    ///
    /// Should be in D-Bus address format, e.g., "unix:path=/path/to/socket".
    /// If not specified, uses the session bus.
    #[arg(long, short = 'a', conflicts_with = "system")]
    address: Option<String>,

    /// Connect to the system bus instead of the session bus.
    #[arg(long)]
    system: bool,

    /// Well-known name to request.
    #[arg(long, short = 'n', default_value = "org.dbusdispatch.Demo")]
    name: String,

    /// Object path of the counter object.
    #[arg(long, short = 'p', default_value = "/org/dbusdispatch/counter")]
    path: String,

    /// Object manager root; must contain the counter path.
    #[arg(long, default_value = "/org/dbusdispatch")]
    manager_path: String,

    /// Delay of the asynchronous Reset method, in milliseconds.
    #[arg(long, default_value_t = 500)]
    reset_delay_ms: u64,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info")]
    log_level: String,
}

struct Counter {
    value: AtomicU32,
    label: String,
    path: String,
    reset_delay: Duration,
    connection: zbus::blocking::Connection,
}

impl Counter {
    fn notify_value(&self, value: u32) {
        let mut changed = HashMap::new();
        changed.insert("Value".to_string(), OwnedValue::from(value));
        if let Err(e) =
            remote::emit_properties_changed(&self.connection, &self.path, COUNTER_INTERFACE, &changed)
        {
            warn!(error = %e, "Couldn't emit PropertiesChanged");
        }
    }
}

fn increment(inv: MethodInvocation, counter: &Counter) {
    let value = counter.value.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    if inv.return_value(&(value,)).is_ok() {
        counter.notify_value(value);
    }
}

fn reset(inv: MethodInvocation, counter: &Counter) {
    std::thread::sleep(counter.reset_delay);
    counter.value.store(0, Ordering::SeqCst);
    if inv.return_empty().is_ok() {
        counter.notify_value(0);
    }
}

fn echo(inv: MethodInvocation, _: &Counter) {
    let sent = match inv.parameters::<String>() {
        Ok(text) => inv.return_value(&(text,)),
        Err(e) => inv.return_error(error_names::INVALID_ARGS, &e.to_string()),
    };
    if let Err(e) = sent {
        warn!(error = %e, "Couldn't answer Echo");
    }
}

static COUNTER_RULES: &[DispatchRule<Counter>] = &[
    DispatchRule::new(increment).method("Increment"),
    DispatchRule::new(reset).method("Reset").asynchronous(),
    DispatchRule::new(echo).method("Echo"),
];

impl SkeletonHandler for Counter {
    fn dispatch_table(&self) -> &'static [DispatchRule<Self>] {
        COUNTER_RULES
    }

    fn get_property(&self, name: &str) -> fdo::Result<OwnedValue> {
        match name {
            "Value" => Ok(OwnedValue::from(self.value.load(Ordering::SeqCst))),
            "Label" => OwnedValue::try_from(Value::from(self.label.as_str()))
                .map_err(|e| fdo::Error::Failed(e.to_string())),
            _ => Err(fdo::Error::UnknownProperty(format!("Unknown property: {name}"))),
        }
    }

    fn set_property(&self, name: &str, value: &Value<'_>) -> fdo::Result<()> {
        match name {
            "Value" => {
                let value = u32::try_from(value).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
                self.value.store(value, Ordering::SeqCst);
                self.notify_value(value);
                Ok(())
            }
            "Label" => Err(fdo::Error::PropertyReadOnly(format!("Property is read-only: {name}"))),
            _ => Err(fdo::Error::UnknownProperty(format!("Unknown property: {name}"))),
        }
    }

    fn properties(&self) -> fdo::Result<HashMap<String, OwnedValue>> {
        COUNTER_INFO
            .properties
            .iter()
            .filter(|p| p.access.readable())
            .map(|p| self.get_property(p.name).map(|v| (p.name.to_string(), v)))
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    if !args.path.starts_with(&format!("{}/", args.manager_path)) && args.manager_path != "/" {
        return Err(Error::Config(format!(
            "object path {} is not below the object manager root {}",
            args.path, args.manager_path
        )));
    }

    info!(
        address = ?args.address,
        system = args.system,
        name = %args.name,
        path = %args.path,
        "Starting dbus-dispatch-demo"
    );

    let bus = if args.system {
        BusConnection::connect_system("system").await?
    } else {
        BusConnection::connect_session(args.address.as_deref(), "session").await?
    };

    let server = Arc::new(SkeletonServer::new(bus.blocking()));
    server.set_object_manager(&args.manager_path)?;

    let counter = Counter {
        value: AtomicU32::new(0),
        label: args.name.clone(),
        path: args.path.clone(),
        reset_delay: Duration::from_millis(args.reset_delay_ms),
        connection: bus.blocking(),
    };
    server.export(&args.path, InterfaceSkeleton::new(&COUNTER_INFO, counter)?)?;

    // Start serving before taking the name so no early call is missed.
    let serving = server.spawn()?;
    bus.request_name(&args.name).await?;

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = tokio::task::spawn_blocking(move || serving.join()) => {
            if !matches!(result, Ok(Ok(()))) {
                error!("D-Bus dispatch thread panicked");
            }
            info!("D-Bus connection closed");
        }
        _ = shutdown => {
            info!("Shutting down");
        }
    }

    server.unexport(&args.path, COUNTER_INTERFACE);
    Ok(())
}
