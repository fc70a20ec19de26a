//! Operator control plane.
//!
//! A line protocol over a unix socket: one command per line, one
//! human-readable reply per command. The command set mirrors what the
//! resource registry can answer; everything else returns an error line.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::Registry;
use crate::generator::Generators;
use crate::resource::ResourceId;

/// Command dispatcher shared by the socket server and tests.
pub struct Ctrl {
    generators: Arc<Generators>,
    system_registry: Arc<Registry>,
}

impl Ctrl {
    pub fn new(generators: Arc<Generators>, system_registry: Arc<Registry>) -> Self {
        Self {
            generators,
            system_registry,
        }
    }

    /// Executes one command line and renders the reply.
    pub fn handle(&self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return String::new();
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "list-resources" => {
                let mut out = String::new();
                for (id, generator, state) in self.generators.list() {
                    out.push_str(&format!("{id} {generator} {state:?}\n"));
                }
                if out.is_empty() {
                    out.push_str("no resources\n");
                }
                out
            }

            "update-resources" => {
                let token = self.generators.update();
                format!("resource updater notified\n{token}\n")
            }

            "updated-since" => match args.len() {
                1 => match args[0].parse::<u64>() {
                    Ok(token) => boolean(self.generators.updated_since(token)),
                    Err(_) => "error: argument is not a number\n".to_string(),
                },
                4 | 5 => {
                    let Ok(token) = args[0].parse::<u64>() else {
                        return "error: argument is not a number\n".to_string();
                    };
                    let require_ready = if args.len() == 5 {
                        match args[4] {
                            "true" => true,
                            "false" => false,
                            _ => return "error: invalid boolean value\n".to_string(),
                        }
                    } else {
                        false
                    };
                    let id = ResourceId::new(args[1], args[2], args[3]);
                    boolean(
                        self.generators
                            .updated_since_resource(&id, token, require_ready),
                    )
                }
                _ => "error: updated-since expects 1, 4 or 5 arguments\n".to_string(),
            },

            "supports-reference-frame" => match args.len() {
                1 => boolean(self.system_registry.frame(args[0]).is_some()),
                _ => "error: supports-reference-frame expects 1 argument\n".to_string(),
            },

            "has-resource" => match args.len() {
                3 => boolean(
                    self.generators
                        .has(&ResourceId::new(args[0], args[1], args[2])),
                ),
                _ => "error: has-resource expects 3 arguments\n".to_string(),
            },

            "is-resource-ready" => match args.len() {
                3 => boolean(
                    self.generators
                        .is_ready(&ResourceId::new(args[0], args[1], args[2])),
                ),
                _ => "error: is-resource-ready expects 3 arguments\n".to_string(),
            },

            "resource-url" => match args.len() {
                3 => match self
                    .generators
                    .url(&ResourceId::new(args[0], args[1], args[2]))
                {
                    Some(url) => format!("{url}\n"),
                    None => "error: no such resource\n".to_string(),
                },
                _ => "error: resource-url expects 3 arguments\n".to_string(),
            },

            "help" => "update-resources  schedule immediate update of resources;\n\
                       \x20                 returns timestamp (usec from Epoch)\n\
                       updated-since timestamp [rf group id [bool]]\n\
                       \x20                 check whether resources have been updated\n\
                       has-resource referenceFrame group id\n\
                       is-resource-ready referenceFrame group id\n\
                       resource-url referenceFrame group id\n\
                       supports-reference-frame referenceFrame\n\
                       list-resources\n"
                .to_string(),

            other => format!("error: unknown command <{other}>\n"),
        }
    }

    /// Serves the line protocol until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        info!("Control socket listening");
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Control accept failed");
                    continue;
                }
            };

            let ctrl = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                loop {
                    let line = tokio::select! {
                        line = lines.next_line() => line,
                        _ = shutdown.cancelled() => break,
                    };
                    match line {
                        Ok(Some(line)) => {
                            debug!(command = %line, "Control command");
                            let reply = ctrl.handle(&line);
                            if write.write_all(reply.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            });
        }
    }
}

fn boolean(value: bool) -> String {
    if value {
        "true\n".to_string()
    } else {
        "false\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{test_support, GeneratorsConfig};
    use crate::resource::tests::test_resource;
    use std::collections::BTreeMap;

    async fn ctrl_with(resources: Vec<crate::resource::Resource>) -> (Ctrl, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let context = test_support::context(dir.path().to_path_buf()).await;
        let generators = Arc::new(Generators::new(context, GeneratorsConfig::default()));
        let wanted: BTreeMap<_, _> = resources.into_iter().map(|r| (r.id.clone(), r)).collect();
        generators.reconcile(wanted).await;
        (Ctrl::new(generators, Registry::system()), dir)
    }

    #[tokio::test]
    async fn test_has_resource() {
        let (ctrl, _dir) = ctrl_with(vec![test_resource("a")]).await;
        assert_eq!(ctrl.handle("has-resource webmercator test a"), "true\n");
        assert_eq!(ctrl.handle("has-resource webmercator test b"), "false\n");
        assert_eq!(
            ctrl.handle("has-resource webmercator test"),
            "error: has-resource expects 3 arguments\n"
        );
    }

    #[tokio::test]
    async fn test_supports_reference_frame() {
        let (ctrl, _dir) = ctrl_with(vec![]).await;
        assert_eq!(ctrl.handle("supports-reference-frame webmercator"), "true\n");
        assert_eq!(ctrl.handle("supports-reference-frame mars"), "false\n");
    }

    #[tokio::test]
    async fn test_update_and_updated_since() {
        let (ctrl, _dir) = ctrl_with(vec![test_resource("a")]).await;

        let reply = ctrl.handle("update-resources");
        let token: u64 = reply.lines().nth(1).unwrap().parse().unwrap();
        // the forced poll has not run yet for this fresh token
        assert_eq!(ctrl.handle(&format!("updated-since {token}")), "false\n");
        // but a token from before the initial reconcile is satisfied
        assert_eq!(ctrl.handle("updated-since 1"), "true\n");
        assert_eq!(
            ctrl.handle("updated-since abc"),
            "error: argument is not a number\n"
        );
    }

    #[tokio::test]
    async fn test_resource_url() {
        let (ctrl, _dir) = ctrl_with(vec![test_resource("a")]).await;
        let reply = ctrl.handle("resource-url webmercator test a");
        assert!(reply.contains("webmercator/tms/test/a"));
    }

    #[tokio::test]
    async fn test_list_and_unknown() {
        let (ctrl, _dir) = ctrl_with(vec![test_resource("a")]).await;
        let listing = ctrl.handle("list-resources");
        assert!(listing.contains("webmercator/test/a"));
        assert!(ctrl.handle("frobnicate").starts_with("error: unknown command"));
        assert!(ctrl.handle("help").contains("update-resources"));
    }

    #[tokio::test]
    async fn test_is_resource_ready_before_prepare() {
        let (ctrl, _dir) = ctrl_with(vec![test_resource("a")]).await;
        // preparation is asynchronous; a fresh resource may not be ready
        let reply = ctrl.handle("is-resource-ready webmercator test a");
        assert!(reply == "true\n" || reply == "false\n");
    }
}
