//! Instrumentation Custom Resource Definition
//!
//! Describes how pods opting into auto-instrumentation are instrumented, with
//! one image block per supported language.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::DefaultImages;

/// A supported auto-instrumentation language
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    /// Java agent
    Java,
    /// NodeJS SDK
    NodeJs,
    /// Python SDK
    Python,
    /// .NET auto-instrumentation
    DotNet,
    /// Go eBPF instrumentation
    Go,
    /// Apache HTTPD module
    ApacheHttpd,
}

impl Language {
    /// Every language, in annotation order
    pub const ALL: [Language; 6] = [
        Language::Java,
        Language::NodeJs,
        Language::Python,
        Language::DotNet,
        Language::Go,
        Language::ApacheHttpd,
    ];

    /// Name used in annotation keys
    pub fn name(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::NodeJs => "nodejs",
            Self::Python => "python",
            Self::DotNet => "dotnet",
            Self::Go => "go",
            Self::ApacheHttpd => "apache-httpd",
        }
    }

    /// Annotation recording the default image the spec was last defaulted to
    pub fn default_image_annotation(&self) -> String {
        format!(
            "instrumentation.opentelemetry.io/default-auto-instrumentation-{}-image",
            self.name()
        )
    }

    /// Pod annotation requesting injection for this language
    pub fn inject_annotation(&self) -> String {
        format!("instrumentation.opentelemetry.io/inject-{}", self.name())
    }

    /// The configured default image for this language
    pub fn default_image<'a>(&self, images: &'a DefaultImages) -> &'a str {
        match self {
            Self::Java => &images.auto_instrumentation_java,
            Self::NodeJs => &images.auto_instrumentation_nodejs,
            Self::Python => &images.auto_instrumentation_python,
            Self::DotNet => &images.auto_instrumentation_dotnet,
            Self::Go => &images.auto_instrumentation_go,
            Self::ApacheHttpd => &images.auto_instrumentation_apache_httpd,
        }
    }
}

/// Image settings for one language
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSpec {
    /// Auto-instrumentation image
    #[serde(default)]
    pub image: String,
}

/// Specification for auto-instrumentation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "opentelemetry.io",
    version = "v1alpha1",
    kind = "Instrumentation",
    plural = "instrumentations",
    shortname = "otelinst",
    namespaced,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.exporter.endpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationSpec {
    /// Exporter endpoint handed to instrumented workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_endpoint: Option<String>,

    /// Java settings
    #[serde(default)]
    pub java: LanguageSpec,
    /// NodeJS settings
    #[serde(default)]
    pub nodejs: LanguageSpec,
    /// Python settings
    #[serde(default)]
    pub python: LanguageSpec,
    /// .NET settings
    #[serde(default)]
    pub dotnet: LanguageSpec,
    /// Go settings
    #[serde(default)]
    pub go: LanguageSpec,
    /// Apache HTTPD settings
    #[serde(default)]
    pub apache_httpd: LanguageSpec,
}

impl InstrumentationSpec {
    /// Settings block for `lang`
    pub fn language(&self, lang: Language) -> &LanguageSpec {
        match lang {
            Language::Java => &self.java,
            Language::NodeJs => &self.nodejs,
            Language::Python => &self.python,
            Language::DotNet => &self.dotnet,
            Language::Go => &self.go,
            Language::ApacheHttpd => &self.apache_httpd,
        }
    }

    /// Mutable settings block for `lang`
    pub fn language_mut(&mut self, lang: Language) -> &mut LanguageSpec {
        match lang {
            Language::Java => &mut self.java,
            Language::NodeJs => &mut self.nodejs,
            Language::Python => &mut self.python,
            Language::DotNet => &mut self.dotnet,
            Language::Go => &mut self.go,
            Language::ApacheHttpd => &mut self.apache_httpd,
        }
    }
}
