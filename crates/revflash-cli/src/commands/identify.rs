//! Identify command - VIN and adapter details

use anyhow::{Context, Result};
use revflash_obd::VehicleClient;

use crate::output::OutputContext;

/// Read the VIN and battery voltage of the connected vehicle
pub async fn identify(client: &VehicleClient, ctx: &OutputContext) -> Result<()> {
    let vin = client.identify().await.context("Failed to read VIN")?;
    let voltage = client
        .read_voltage()
        .await
        .context("Failed to read battery voltage")?;

    ctx.print_kv(&[
        ("Adapter", client.adapter_description()),
        ("State", client.connection_state().to_string()),
        ("VIN", vin),
        ("Battery", format!("{:.1} V", voltage)),
    ]);
    Ok(())
}
