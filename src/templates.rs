//! Rendered configuration artifacts
//!
//! Every file pushed to a host comes from a Handlebars template compiled into
//! the binary. Rendering is strict: a variable the template references but the
//! context lacks is an error, never an empty string in a config file.

use crate::error::{Result, SetupError};
use handlebars::Handlebars;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    KubeadmSimple,
    KubeadmHa,
    Calico,
    Haproxy,
    Keepalived,
    CheckApiserver,
}

impl Template {
    pub const ALL: [Template; 6] = [
        Template::KubeadmSimple,
        Template::KubeadmHa,
        Template::Calico,
        Template::Haproxy,
        Template::Keepalived,
        Template::CheckApiserver,
    ];

    fn name(&self) -> &'static str {
        match self {
            Template::KubeadmSimple => "kubeadm-config-simple",
            Template::KubeadmHa => "kubeadm-config-ha",
            Template::Calico => "calico",
            Template::Haproxy => "haproxy",
            Template::Keepalived => "keepalived",
            Template::CheckApiserver => "check-apiserver",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Template::KubeadmSimple => include_str!("../templates/kubeadm-config-simple.yaml.hbs"),
            Template::KubeadmHa => include_str!("../templates/kubeadm-config-ha.yaml.hbs"),
            Template::Calico => include_str!("../templates/calico.yaml.hbs"),
            Template::Haproxy => include_str!("../templates/haproxy.cfg.hbs"),
            Template::Keepalived => include_str!("../templates/keepalived.conf.hbs"),
            Template::CheckApiserver => include_str!("../templates/check_apiserver.sh.hbs"),
        }
    }

    /// File name the rendered artifact gets in the login user's home directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Template::KubeadmSimple | Template::KubeadmHa => "kubeadm-config.yaml",
            Template::Calico => "calico.yaml",
            Template::Haproxy => "haproxy.cfg",
            Template::Keepalived => "keepalived.conf",
            Template::CheckApiserver => "check_apiserver.sh",
        }
    }
}

/// Variables for the cluster-init and overlay manifests
#[derive(Debug, Clone, Serialize)]
pub struct KubeadmContext {
    pub advertise_address: String,
    pub kube_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    /// `host:port` every node reaches the API through; HA only
    pub control_plane_endpoint: Option<String>,
    pub control_planes: Vec<ControlPlaneMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneMember {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaproxyContext {
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepalivedContext {
    pub state: String,
    pub interface: String,
    pub virtual_router_id: u8,
    pub priority: u8,
    pub auth_pass: String,
    pub virtual_ip: String,
}

pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        // Config files, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);

        for template in Template::ALL {
            handlebars
                .register_template_string(template.name(), template.source())
                .map_err(|e| {
                    SetupError::template(format!("failed to compile {}: {}", template.name(), e))
                })?;
        }
        Ok(Self { handlebars })
    }

    pub fn render<T: Serialize>(&self, template: Template, context: &T) -> Result<String> {
        self.handlebars
            .render(template.name(), context)
            .map_err(|e| SetupError::template(format!("failed to render {}: {}", template.name(), e)))
    }
}
