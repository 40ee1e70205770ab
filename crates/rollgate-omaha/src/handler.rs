//! Per-request Omaha processing on top of the rollout engine.

use std::sync::Arc;

use rollgate_core::{Arch, ChannelAliases, normalize_app_id};
use rollgate_rollout::{Admission, Controller, EventReport, RolloutError};
use rollgate_state::{EventResult, EventType, Package, PackageType};
use tracing::{debug, warn};

use crate::error::OmahaError;
use crate::protocol::*;

const FLATCAR_ACTION_EVENT: &str = "postinstall";

/// Status token for an engine error. Unmapped errors share one generic token.
pub fn status_token(err: &RolloutError) -> &'static str {
    match err {
        RolloutError::NoPackageFound => "error-noPackageFound",
        RolloutError::InvalidApplicationOrGroup => "error-unknownApplicationOrGroup",
        RolloutError::RegisterInstanceFailed => "error-instanceRegistrationFailed",
        RolloutError::MaxUpdatesPerPeriodLimitReached => "error-maxUpdatesPerPeriodLimitReached",
        RolloutError::MaxConcurrentUpdatesLimitReached => "error-maxConcurrentUpdatesLimitReached",
        RolloutError::MaxTimedOutUpdatesLimitReached => "error-maxTimedOutUpdatesLimitReached",
        RolloutError::UpdatesDisabled => "error-updatesDisabled",
        RolloutError::GetUpdatesStatsFailed => "error-couldNotCheckUpdatesStats",
        RolloutError::UpdateInProgressOnInstance => "error-updateInProgressOnInstance",
        _ => "error-failedToRetrieveUpdatePackageInfo",
    }
}

/// Board string first, then the OS architecture, then amd64.
pub fn resolve_arch(board: &str, os_arch: Option<&str>) -> Arch {
    Arch::from_board(board)
        .or_else(|| os_arch.and_then(Arch::from_os_arch))
        .unwrap_or(Arch::Amd64)
}

#[derive(Clone)]
pub struct Handler {
    controller: Controller,
    aliases: Arc<ChannelAliases>,
}

impl Handler {
    pub fn new(controller: Controller, aliases: ChannelAliases) -> Self {
        Self {
            controller,
            aliases: Arc::new(aliases),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Decode `body`, process every app entry and encode the response.
    pub fn handle(&self, body: &str, ip: &str) -> Result<String, OmahaError> {
        let request = Request::from_xml(body)?;
        self.build_response(&request, ip).to_xml()
    }

    pub fn build_response(&self, request: &Request, ip: &str) -> Response {
        let os_arch = request.os.as_ref().map(|os| os.arch.as_str());
        let mut response = Response::new();
        for app in &request.apps {
            response.apps.push(self.process_app(app, os_arch, ip));
        }
        response
    }

    fn process_app(&self, app: &AppRequest, os_arch: Option<&str>, ip: &str) -> AppResponse {
        let mut out = AppResponse::new(&app.id);
        let app_id = normalize_app_id(&app.id);
        let arch = resolve_arch(&app.board, os_arch);
        let group_id = self
            .aliases
            .resolve(&app_id, arch, &app.track)
            .unwrap_or(app.track.as_str())
            .to_string();
        let instance_id = app.machine_id.as_str();

        if let Err(e) = self.controller.validate_application_and_group(&app_id, &group_id) {
            debug!(app = %app_id, track = %app.track, %arch, error = %e, "rejecting app entry");
            out.status = status_token(&e).to_string();
            return out;
        }

        for event in &app.events {
            out.events.push(StatusAck::ok());
            let Some((event_type, event_result)) = event.codes() else {
                warn!(
                    instance = %instance_id,
                    app = %app_id,
                    event_type = %event.event_type,
                    event_result = %event.event_result,
                    "skipping event with non-numeric codes"
                );
                continue;
            };
            let report = EventReport {
                event_type: EventType::from_code(event_type),
                result: EventResult::from_code(event_result),
                previous_version: event.previous_version.clone(),
                error_code: event.error_code.clone(),
            };
            if let Err(e) = self
                .controller
                .register_event(instance_id, &app_id, &group_id, &report)
            {
                warn!(
                    instance = %instance_id,
                    app = %app_id,
                    group = %group_id,
                    event_type,
                    event_result,
                    error = %e,
                    "registering event failed"
                );
            }
        }

        if app.ping.is_some() {
            match self
                .controller
                .register_instance(instance_id, ip, &app.version, &app_id, &group_id)
            {
                Ok(_) => out.ping = Some(StatusAck::ok()),
                Err(e) => {
                    warn!(instance = %instance_id, app = %app_id, error = %e, "registering instance failed");
                    out.status = status_token(&RolloutError::RegisterInstanceFailed).to_string();
                }
            }
        }

        if app.update_check.is_some() {
            match self
                .controller
                .get_update_package(instance_id, ip, &app.version, &app_id, &group_id)
            {
                Ok(Admission::Update(package)) => {
                    out.update_check = Some(self.update_check_for(&package));
                }
                Ok(Admission::NoUpdate) => {
                    debug!(instance = %instance_id, app = %app_id, version = %app.version, "no update");
                }
                Err(e) => {
                    debug!(instance = %instance_id, app = %app_id, error = %e, "update check denied");
                    out.update_check = Some(UpdateCheckResponse::with_status(status_token(&e)));
                }
            }
        }

        out
    }

    fn update_check_for(&self, package: &Package) -> UpdateCheckResponse {
        let actions = match package.package_type {
            PackageType::Flatcar => self.flatcar_actions(package),
            _ => None,
        };
        UpdateCheckResponse {
            status: APP_OK.to_string(),
            urls: Some(Urls {
                urls: vec![Url {
                    codebase: package.url.clone(),
                }],
            }),
            manifest: Some(Manifest {
                version: package.version.clone(),
                packages: Packages {
                    packages: vec![PackageEntry {
                        name: package.filename.clone().unwrap_or_default(),
                        hash: package.hash.clone(),
                        size: package.size.clone(),
                        required: true,
                    }],
                },
                actions,
            }),
        }
    }

    fn flatcar_actions(&self, package: &Package) -> Option<Actions> {
        let action = match self.controller.store().get_flatcar_action(&package.id) {
            Ok(Some(action)) => action,
            Ok(None) => return None,
            Err(e) => {
                warn!(package = %package.id, error = %e, "loading flatcar action failed");
                return None;
            }
        };
        let event = if action.event.is_empty() {
            FLATCAR_ACTION_EVENT.to_string()
        } else {
            action.event
        };
        Some(Actions {
            actions: vec![Action {
                event,
                chromeos_version: action.chromeos_version,
                sha256: action.sha256,
                needs_admin: action.needs_admin,
                is_delta: action.is_delta,
                disable_payload_backoff: action.disable_payload_backoff,
                metadata_signature_rsa: action.metadata_signature_rsa,
                metadata_size: action.metadata_size,
                deadline: action.deadline,
            }],
        })
    }
}
