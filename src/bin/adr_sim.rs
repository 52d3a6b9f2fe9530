use anyhow::Result;

use adrmon::config::Config;
use adrmon::logging::{self, log, obj, v_str, Domain, Level};
use adrmon::sim::{self, SimConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // No terminal UI here, so echo records to the console unless told otherwise.
    if std::env::var_os("LOG_STDERR").is_none() {
        std::env::set_var("LOG_STDERR", "1");
    }
    let cfg = SimConfig::from_config(&Config::from_env());
    let listener = sim::bind(&cfg.addr).await?;

    eprintln!(
        "[adr-sim] listening on ws://{}/ws (step {} ms)",
        listener.local_addr()?,
        cfg.step.as_millis()
    );

    let result = tokio::select! {
        res = sim::serve(listener, cfg) => res,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    if let Err(err) = &result {
        log(Level::Error, Domain::Sim, "fatal", obj(&[("error", v_str(&err.to_string()))]));
    }
    logging::flush();
    result
}
