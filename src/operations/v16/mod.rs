pub mod authorize;
pub mod boot_notification;
pub mod cancel_reservation;
pub mod change_availability;
pub mod change_configuration;
pub mod clear_cache;
pub mod data_transfer;
pub mod diagnostics_status_notification;
pub mod firmware_status_notification;
pub mod get_configuration;
pub mod get_diagnostics;
pub mod get_local_list_version;
pub mod heartbeat;
pub mod meter_values;
pub mod remote_start_transaction;
pub mod remote_stop_transaction;
pub mod reserve_now;
pub mod reset;
pub mod security_event_notification;
pub mod send_local_list;
pub mod start_transaction;
pub mod status_notification;
pub mod stop_transaction;
pub mod trigger_message;
pub mod unlock_connector;
pub mod update_firmware;

use crate::rpc::registry::OperationRegistry;

/// Register every CSMS-initiated action of the 1.6 profile set.
pub fn register(registry: &mut OperationRegistry) {
    registry.register("ChangeAvailability", Box::new(|| {
        Box::new(change_availability::ChangeAvailability::new())
    }));
    registry.register("ChangeConfiguration", Box::new(|| {
        Box::new(change_configuration::ChangeConfiguration::new())
    }));
    registry.register("GetConfiguration", Box::new(|| {
        Box::new(get_configuration::GetConfiguration::new())
    }));
    registry.register("ClearCache", Box::new(|| Box::new(clear_cache::ClearCache::new())));
    registry.register("DataTransfer", Box::new(|| Box::new(data_transfer::DataTransfer::inbound())));
    registry.register("RemoteStartTransaction", Box::new(|| {
        Box::new(remote_start_transaction::RemoteStartTransaction::new())
    }));
    registry.register("RemoteStopTransaction", Box::new(|| {
        Box::new(remote_stop_transaction::RemoteStopTransaction::new())
    }));
    registry.register("Reset", Box::new(|| Box::new(reset::Reset::new())));
    registry.register("UnlockConnector", Box::new(|| {
        Box::new(unlock_connector::UnlockConnector::new())
    }));
    registry.register("TriggerMessage", Box::new(|| {
        Box::new(trigger_message::TriggerMessage::new())
    }));
    registry.register("ReserveNow", Box::new(|| Box::new(reserve_now::ReserveNow::new())));
    registry.register("CancelReservation", Box::new(|| {
        Box::new(cancel_reservation::CancelReservation::new())
    }));
    registry.register("GetLocalListVersion", Box::new(|| {
        Box::new(get_local_list_version::GetLocalListVersion::new())
    }));
    registry.register("SendLocalList", Box::new(|| {
        Box::new(send_local_list::SendLocalList::new())
    }));
    registry.register("GetDiagnostics", Box::new(|| {
        Box::new(get_diagnostics::GetDiagnostics::new())
    }));
    registry.register("UpdateFirmware", Box::new(|| {
        Box::new(update_firmware::UpdateFirmware::new())
    }));
}
