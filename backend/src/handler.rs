//! Request handlers for the Jest API
//!
//! This module contains handler functions that process API requests
//! and interact with the [`Jest`] service context. Lifecycle and store
//! work is blocking and runs on the blocking pool under the configured
//! request timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::{ApiError, Endpoint, Method, Request, Response};
use crate::bootstrap::BootstrapRequest;
use crate::jail::CreateJailRequest;
use crate::lifecycle::StopOutcome;
use crate::Jest;

/// Handle an API request and return a response
pub async fn handle_request(request: Request, jest: Arc<Jest>) -> Response {
    // Parse the endpoint
    let endpoint = match request.parse_endpoint() {
        Ok(ep) => ep,
        Err(err) => return Response::failure(err),
    };

    // Route to appropriate handler based on endpoint and method
    match (&request.method, endpoint) {
        (Method::Get, Endpoint::Init) => init_status(jest).await,
        (Method::Post, Endpoint::Init) => match serde_json::from_value::<BootstrapRequest>(request.body) {
            Ok(req) => bootstrap(jest, req).await,
            Err(err) => Response::bad_request(format!("Invalid request body: {}", err)),
        },
        (Method::Get, Endpoint::InitDatasets) => tagged_datasets(jest).await,
        (Method::Get, Endpoint::InitStatus(name)) => bootstrap_progress(jest, &name).await,

        (Method::Get, Endpoint::Templates) => list_templates(jest).await,
        (Method::Get, Endpoint::Template(name)) => get_template(jest, name).await,
        (Method::Post, Endpoint::DisableTemplate(name)) => set_template_disabled(jest, name, true).await,
        (Method::Post, Endpoint::EnableTemplate(name)) => set_template_disabled(jest, name, false).await,

        (Method::Get, Endpoint::Jails) => list_jails(jest).await,
        (Method::Post, Endpoint::Jails) => match serde_json::from_value::<CreateJailRequest>(request.body) {
            Ok(req) => create_jail(jest, req).await,
            Err(err) => Response::bad_request(format!("Invalid request body: {}", err)),
        },
        (Method::Get, Endpoint::Jail(name)) => get_jail(jest, name).await,
        (Method::Delete, Endpoint::Jail(name)) => delete_jail(jest, name).await,
        (Method::Post, Endpoint::StartJail(name)) => start_jail(jest, name).await,
        (Method::Post, Endpoint::StopJail(name)) => stop_jail(jest, name).await,
        (Method::Delete, Endpoint::JailDataset(name)) => destroy_jail_dataset(jest, name).await,

        (Method::Get, Endpoint::Config) => list_configs(jest).await,

        _ => Response::bad_request(format!(
            "Method {:?} not supported for endpoint {}",
            request.method, request.endpoint
        )),
    }
}

/// Run blocking service work under the request timeout.
///
/// On timeout the task is left to finish on its own and the caller gets 504.
async fn blocking<T, E, F>(timeout: Duration, operation: &str, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result.map_err(Into::into),
        Ok(Err(e)) => Err(ApiError::Internal(format!("{} failed: {}", operation, e))),
        Err(_) => {
            warn!("{} did not finish within {:?}", operation, timeout);
            Err(ApiError::Timeout(operation.to_string()))
        }
    }
}

fn request_timeout(jest: &Jest) -> Duration {
    Duration::from_secs(jest.config().api.timeout)
}

/// Report whether a managed root exists
async fn init_status(jest: Arc<Jest>) -> Response {
    let service = Arc::clone(&jest);
    let status = match blocking(request_timeout(&jest), "init status", move || service.init_status()).await {
        Ok(status) => status,
        Err(err) => return Response::failure(err),
    };
    let message = if status.initialised {
        "Host is initialised"
    } else {
        "Host is not initialised"
    };
    Response::success(message, status)
}

/// List every dataset carrying a jest tag
async fn tagged_datasets(jest: Arc<Jest>) -> Response {
    let timeout = request_timeout(&jest);
    let service = Arc::clone(&jest);
    match blocking(timeout, "dataset discovery", move || service.tagged_datasets()).await {
        Ok(datasets) if datasets.is_empty() => Response::not_found("Datasets tagged by jest"),
        Ok(datasets) => Response::success(format!("{} tagged datasets", datasets.len()), datasets),
        Err(err) => Response::failure(err),
    }
}

/// Build a template from the mirror
async fn bootstrap(jest: Arc<Jest>, request: BootstrapRequest) -> Response {
    let name = request.template_name().to_string();
    let timeout = Duration::from_secs(jest.config().api.bootstrap_timeout);
    info!("Bootstrap of template {} requested", name);

    // Spawned so that a timed out request leaves the pipeline running
    let service = Arc::clone(&jest);
    let task = tokio::spawn(async move { service.bootstrap_from_mirror(request).await });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(outcome))) => Response::created(format!("Template {} is ready", name), outcome),
        Ok(Ok(Err(err))) => Response::failure(err),
        Ok(Err(e)) => Response::internal_error(format!("Bootstrap task failed: {}", e)),
        Err(_) => {
            warn!("Bootstrap of {} still running after {:?}", name, timeout);
            Response::timeout(format!("bootstrap of {}", name))
        }
    }
}

/// Latest progress report of a bootstrap
async fn bootstrap_progress(jest: Arc<Jest>, name: &str) -> Response {
    match jest.bootstrap_progress(name).await {
        Some(progress) => Response::success(progress.current_step.clone(), progress),
        None => Response::not_found(format!("Bootstrap of template '{}'", name)),
    }
}

async fn list_templates(jest: Arc<Jest>) -> Response {
    let templates = jest.templates().clone();
    match blocking(request_timeout(&jest), "template list", move || templates.list()).await {
        Ok(list) => Response::success(format!("{} templates", list.len()), list),
        Err(err) => Response::failure(err),
    }
}

async fn get_template(jest: Arc<Jest>, name: String) -> Response {
    let templates = jest.templates().clone();
    match blocking(request_timeout(&jest), "template lookup", move || templates.get(&name)).await {
        Ok(template) => Response::success(format!("Template {}", template.name), template),
        Err(err) => Response::failure(err),
    }
}

async fn set_template_disabled(jest: Arc<Jest>, name: String, disabled: bool) -> Response {
    let templates = jest.templates().clone();
    let operation = if disabled { "template disable" } else { "template enable" };
    match blocking(request_timeout(&jest), operation, move || templates.set_disabled(&name, disabled)).await {
        Ok(template) => {
            let state = if template.disabled { "disabled" } else { "enabled" };
            info!("Template {} {}", template.name, state);
            Response::success(format!("Template {} {}", template.name, state), template)
        }
        Err(err) => Response::failure(err),
    }
}

/// List all jails with their live state
async fn list_jails(jest: Arc<Jest>) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail list", move || jails.list()).await {
        Ok(list) => Response::success(format!("{} jails", list.len()), list),
        Err(err) => Response::failure(err),
    }
}

/// Get information about a specific jail
async fn get_jail(jest: Arc<Jest>, name: String) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail lookup", move || jails.get(&name)).await {
        Ok(view) => Response::success(format!("Jail {}", view.config.name), view),
        Err(err) => Response::failure(err),
    }
}

/// Provision a jail by cloning its template
async fn create_jail(jest: Arc<Jest>, request: CreateJailRequest) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail create", move || jails.create(&request)).await {
        Ok(view) => {
            info!("Jail {} created on {}", view.config.name, view.config.dataset);
            Response::created(format!("Jail {} created", view.config.name), view)
        }
        Err(err) => Response::failure(err),
    }
}

async fn start_jail(jest: Arc<Jest>, name: String) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail start", move || jails.start(&name)).await {
        Ok(view) => Response::success(format!("Jail {} started", view.config.name), view),
        Err(err) => Response::failure(err),
    }
}

async fn stop_jail(jest: Arc<Jest>, name: String) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail stop", move || jails.stop(&name)).await {
        Ok(outcome) => {
            let message = match &outcome {
                StopOutcome::Stopped(state) => format!("Jail {} stopped", state.name),
                StopOutcome::NotRunning(state) => format!("Jail {} is not running", state.name),
            };
            Response::success(message, outcome)
        }
        Err(err) => Response::failure(err),
    }
}

/// Remove a jail's record; its dataset stays until destroyed explicitly
async fn delete_jail(jest: Arc<Jest>, name: String) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail delete", move || jails.delete(&name)).await {
        Ok(jail) => Response::success(format!("Jail {} deleted; dataset {} kept", jail.name, jail.dataset), jail),
        Err(err) => Response::failure(err),
    }
}

async fn destroy_jail_dataset(jest: Arc<Jest>, name: String) -> Response {
    let jails = jest.jails().clone();
    match blocking(request_timeout(&jest), "jail dataset destroy", move || jails.destroy_dataset(&name)).await {
        Ok(dataset) => Response::success(format!("Dataset {} destroyed", dataset), dataset),
        Err(err) => Response::failure(err),
    }
}

/// List host config records in write order
async fn list_configs(jest: Arc<Jest>) -> Response {
    let service = Arc::clone(&jest);
    match blocking(request_timeout(&jest), "config list", move || service.host_configs()).await {
        Ok(configs) => Response::success(format!("{} config records", configs.len()), configs),
        Err(err) => Response::failure(err),
    }
}
