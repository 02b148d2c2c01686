//! Control socket listener and request dispatch.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use super::exec;
use super::wire::{
    AdjustRequest, RemoveRequest, Request, Response, RunRequest, StartRequest, StopRequest,
};
use crate::container::Manager;
use crate::image::{ImagePuller, ImageStore};
use crate::network;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to prepare socket {path}: {source}")]
    Socket {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The daemon: accepts connections and dispatches framed requests. One
/// thread per connection; an exec request takes the connection over and
/// never returns to the loop.
#[derive(Clone)]
pub struct Server {
    manager: Manager,
    images: ImageStore,
    puller: Arc<dyn ImagePuller>,
    socket_path: PathBuf,
}

impl Server {
    pub fn new(
        manager: Manager,
        images: ImageStore,
        puller: Arc<dyn ImagePuller>,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            manager,
            images,
            puller,
            socket_path,
        }
    }

    /// Binds the socket and serves until the process exits. Bind and
    /// permission failures are fatal; everything per-connection is not.
    pub fn run(&self) -> Result<(), ServerError> {
        // idempotent host setup; containers fail later if this could not
        // complete, the control surface stays up regardless
        if let Err(err) = network::ensure_bridge() {
            tracing::warn!(%err, "could not set up host bridge");
        }
        if let Err(err) = self.manager.prepare_host() {
            tracing::warn!(%err, "could not prepare parent cgroup");
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path).map_err(|source| ServerError::Socket {
                path: self.socket_path.clone(),
                source,
            })?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|source| ServerError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o660)).map_err(
            |source| ServerError::Socket {
                path: self.socket_path.clone(),
                source,
            },
        )?;

        tracing::info!(socket = %self.socket_path.display(), "daemon listening");

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    let result = std::thread::Builder::new()
                        .name("conn".to_string())
                        .spawn(move || server.handle_connection(stream));
                    if let Err(err) = result {
                        tracing::warn!(%err, "could not spawn connection thread");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                }
            }
        }

        Ok(())
    }

    /// Reads requests off one connection until EOF. Requests are
    /// handled sequentially; `exec` hands the connection over.
    fn handle_connection(&self, stream: UnixStream) {
        tracing::debug!("client connected");

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(%err, "could not clone connection");
                return;
            }
        };
        let requests = serde_json::Deserializer::from_reader(reader).into_iter::<Request>();

        for request in requests {
            let request = match request {
                Ok(request) => request,
                Err(err) => {
                    if !err.is_eof() {
                        tracing::warn!(%err, "could not decode request");
                    }
                    return;
                }
            };

            tracing::debug!(command = %request.command, "dispatching request");
            if request.command == "exec" {
                exec::handle_exec(&self.manager, request.payload, stream);
                return;
            }

            let response = self.dispatch(&request.command, request.payload);
            let mut writer = &stream;
            if let Err(err) = serde_json::to_writer(&mut writer, &response)
                .map_err(std::io::Error::from)
                .and_then(|()| writer.flush())
            {
                tracing::warn!(%err, "could not write response");
                return;
            }
        }

        tracing::debug!("client disconnected");
    }

    fn dispatch(&self, command: &str, payload: Value) -> Response {
        match command {
            "run" => self.handle_run(payload),
            "ps" => self.handle_ps(),
            "start" => self.handle_start(payload),
            "stop" => self.handle_stop(payload),
            "rm" => self.handle_remove(payload),
            "adjust" => self.handle_adjust(payload),
            "pull" => self.handle_pull(payload),
            "images" => self.handle_images(),
            unknown => Response::error(format!("unknown command: {unknown}")),
        }
    }

    fn handle_run(&self, payload: Value) -> Response {
        let request: RunRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => return Response::error(format!("invalid run payload: {err}")),
        };

        match self.manager.create_and_run(request) {
            Ok(id) => Response::success(format!("container started: {id}")),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_ps(&self) -> Response {
        match self.manager.list() {
            Ok(records) => match serde_json::to_value(records) {
                Ok(data) => Response::success_with_data(data),
                Err(err) => Response::error(format!("could not encode container list: {err}")),
            },
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_start(&self, payload: Value) -> Response {
        let request: StartRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => return Response::error(format!("invalid start payload: {err}")),
        };

        if request.attach {
            // best-effort extension; the container still starts detached
            tracing::warn!("attach requested but not supported, starting detached");
        }

        match self.manager.start(&request.container_id) {
            Ok(id) => Response::success(format!("container started: {id}")),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_stop(&self, payload: Value) -> Response {
        let request: StopRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => return Response::error(format!("invalid stop payload: {err}")),
        };

        if request.all {
            return match self.manager.stop_all() {
                Ok(count) => Response::success(format!("stopped {count} containers")),
                Err(err) => Response::error(err.to_string()),
            };
        }
        if request.container_id.is_empty() {
            return Response::error("stop needs a container id or all".to_string());
        }

        match self.manager.stop(&request.container_id) {
            Ok(()) => Response::success(format!("container stopped: {}", request.container_id)),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_remove(&self, payload: Value) -> Response {
        let request: RemoveRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => return Response::error(format!("invalid rm payload: {err}")),
        };

        if request.all {
            return match self.manager.remove_all() {
                Ok(count) => Response::success(format!("removed {count} containers")),
                Err(err) => Response::error(err.to_string()),
            };
        }
        if request.container_id.is_empty() {
            return Response::error("rm needs a container id or all".to_string());
        }

        match self.manager.remove(&request.container_id) {
            Ok(()) => Response::success(format!("container removed: {}", request.container_id)),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_adjust(&self, payload: Value) -> Response {
        let request: AdjustRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => return Response::error(format!("invalid adjust payload: {err}")),
        };

        match self.manager.adjust(&request.container_id, &request.limits) {
            Ok(()) => Response::success(format!("limits adjusted: {}", request.container_id)),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_pull(&self, payload: Value) -> Response {
        let reference: String = match serde_json::from_value(payload) {
            Ok(reference) => reference,
            Err(err) => return Response::error(format!("invalid pull payload: {err}")),
        };
        if reference.is_empty() {
            return Response::error("pull needs an image reference".to_string());
        }

        match self.puller.pull(&reference) {
            Ok(()) => Response::success(format!("image pulled: {reference}")),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle_images(&self) -> Response {
        match self.images.list() {
            Ok(images) => match serde_json::to_value(images) {
                Ok(data) => Response::success_with_data(data),
                Err(err) => Response::error(format!("could not encode image list: {err}")),
            },
            Err(err) => Response::error(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPuller {
        pulled: Mutex<Vec<String>>,
    }

    impl ImagePuller for RecordingPuller {
        fn pull(&self, reference: &str) -> Result<(), ImageError> {
            self.pulled.lock().unwrap().push(reference.to_string());
            Ok(())
        }
    }

    fn fixture_server() -> (tempfile::TempDir, tempfile::TempDir, Server, Arc<RecordingPuller>) {
        let storage = tempfile::tempdir().unwrap();
        let cgroup_root = tempfile::tempdir().unwrap();
        let manager = Manager::with_paths(storage.path(), cgroup_root.path()).unwrap();
        manager.store().ensure_layout().unwrap();
        let images = ImageStore::new(storage.path().join("images"));
        let puller = Arc::new(RecordingPuller::default());
        let server = Server::new(
            manager,
            images.clone(),
            puller.clone(),
            storage.path().join("gantryd.sock"),
        );
        (storage, cgroup_root, server, puller)
    }

    #[test]
    fn test_unknown_command() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch("teleport", Value::Null);
        assert_eq!(response.status, "error");
        assert!(response.message.unwrap().contains("unknown command"));
    }

    #[test]
    fn test_ps_returns_record_array() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch("ps", Value::Null);
        assert_eq!(response.status, "success");
        assert_eq!(response.data.unwrap(), serde_json::json!([]));
    }

    #[test]
    fn test_stop_unknown_container_is_an_error() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch(
            "stop",
            serde_json::json!({"containerID": "does-not-exist"}),
        );
        assert_eq!(response.status, "error");
        assert!(response.message.unwrap().contains("does-not-exist"));
    }

    #[test]
    fn test_stop_without_target_is_an_error() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch("stop", serde_json::json!({}));
        assert_eq!(response.status, "error");
    }

    #[test]
    fn test_run_with_unknown_image_leaves_nothing_behind() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch(
            "run",
            serde_json::json!({"image": "ghost", "command": "/bin/sh"}),
        );
        assert_eq!(response.status, "error");
        assert!(response.message.unwrap().contains("not found"));
        let leftover = server.manager.list().unwrap();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_pull_delegates_to_the_collaborator() {
        let (_s, _c, server, puller) = fixture_server();
        let response = server.dispatch("pull", serde_json::json!("alpine:latest"));
        assert_eq!(response.status, "success");
        assert_eq!(*puller.pulled.lock().unwrap(), vec!["alpine:latest"]);
    }

    #[test]
    fn test_images_lists_manifest() {
        let (_s, _c, server, _p) = fixture_server();
        server.images.record("alpine:latest", "img_1").unwrap();

        let response = server.dispatch("images", Value::Null);
        assert_eq!(response.status, "success");
        assert_eq!(response.data.unwrap(), serde_json::json!(["alpine:latest"]));
    }

    #[test]
    fn test_invalid_payload_is_an_error_not_a_panic() {
        let (_s, _c, server, _p) = fixture_server();
        let response = server.dispatch("adjust", serde_json::json!({"bogus": true}));
        assert_eq!(response.status, "error");
        assert!(response.message.unwrap().contains("invalid adjust payload"));
    }
}
