// Per-partition MCP configuration: assembled from the stored entities for
// listing, and bulk-imported from the same document shape.

use std::collections::BTreeMap;

use chrono::Utc;
use mcpd_common::types::{JsonMap, McpFunction, McpModule, McpSetting, McpType, ModuleClass, Partition};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::EntityService;
use crate::store::StoreError;

/// A tool, resource or prompt as MCP clients list it: name and description
/// plus the type-specific schema fields (`inputSchema`, `uri`, `arguments`...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub schema: JsonMap,
}

/// Binds a function name to the module class that implements it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleLink {
    #[serde(rename = "type")]
    pub mcp_type: McpType,
    pub name: String,
    pub module_name: String,
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default = "default_return_type")]
    pub return_type: String,
    #[serde(default)]
    pub is_async: bool,
}

fn default_return_type() -> String {
    "text".to_string()
}

/// One class of a module, with its setting inlined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDefinition {
    pub module_name: String,
    pub package_name: String,
    pub class_name: String,
    #[serde(default)]
    pub setting: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpConfiguration {
    pub tools: Vec<FunctionDefinition>,
    pub resources: Vec<FunctionDefinition>,
    pub prompts: Vec<FunctionDefinition>,
    pub module_links: Vec<ModuleLink>,
    pub modules: Vec<ModuleDefinition>,
}

impl McpConfiguration {
    pub fn definitions(&self, mcp_type: McpType) -> &[FunctionDefinition] {
        match mcp_type {
            McpType::Tool => &self.tools,
            McpType::Resource => &self.resources,
            McpType::Prompt => &self.prompts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportStats {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub module_links: usize,
    pub modules: usize,
    pub settings: usize,
}

/// Setting id given to a module class's inlined setting on import.
pub fn class_setting_id(module_name: &str, class_name: &str) -> String {
    format!("{module_name}:{class_name}")
}

pub(super) async fn assemble(service: &EntityService, partition: &Partition) -> Result<McpConfiguration, StoreError> {
    let mut configuration = McpConfiguration::default();

    for function in service.list_functions(partition, None).await? {
        let definition = FunctionDefinition {
            name: function.name.clone(),
            description: function.description.clone(),
            schema: function.schema.clone(),
        };
        match function.mcp_type {
            McpType::Tool => configuration.tools.push(definition),
            McpType::Resource => configuration.resources.push(definition),
            McpType::Prompt => configuration.prompts.push(definition),
        }
        if let Some((module_name, class_name)) = function.binding() {
            configuration.module_links.push(ModuleLink {
                mcp_type: function.mcp_type,
                name: function.name.clone(),
                module_name: module_name.to_string(),
                class_name: class_name.to_string(),
                function_name: function.function_name.clone(),
                return_type: function.return_type.clone(),
                is_async: function.is_async,
            });
        }
    }

    for module in service.list_modules(partition).await? {
        for class in &module.classes {
            let setting = match &class.setting_id {
                Some(id) => service.setting(partition, id).await?.map(|s| s.setting).unwrap_or_default(),
                None => JsonMap::new(),
            };
            configuration.modules.push(ModuleDefinition {
                module_name: module.module_name.clone(),
                package_name: module.package_name.clone(),
                class_name: class.class_name.clone(),
                setting,
                source: module.source_uri.clone(),
            });
        }
    }

    Ok(configuration)
}

impl EntityService {
    /// Load a configuration document into the store through the purging
    /// mutations. Functions not mentioned by the document are left alone.
    pub async fn import_configuration(
        &self,
        partition: &Partition,
        document: McpConfiguration,
        updated_by: &str,
    ) -> Result<ImportStats, StoreError> {
        let now = Utc::now();
        let mut stats = ImportStats::default();
        let mut functions: BTreeMap<String, McpFunction> = BTreeMap::new();

        let typed = [
            (McpType::Tool, document.tools),
            (McpType::Resource, document.resources),
            (McpType::Prompt, document.prompts),
        ];
        for (mcp_type, definitions) in typed {
            for definition in definitions {
                match mcp_type {
                    McpType::Tool => stats.tools += 1,
                    McpType::Resource => stats.resources += 1,
                    McpType::Prompt => stats.prompts += 1,
                }
                functions.insert(
                    definition.name.clone(),
                    McpFunction {
                        partition: partition.clone(),
                        name: definition.name,
                        mcp_type,
                        description: definition.description,
                        module_name: None,
                        class_name: None,
                        function_name: None,
                        is_async: false,
                        return_type: default_return_type(),
                        schema: definition.schema,
                        updated_by: updated_by.to_string(),
                        updated_at: now,
                    },
                );
            }
        }

        for link in document.module_links {
            stats.module_links += 1;
            let function = functions.entry(link.name.clone()).or_insert_with(|| McpFunction {
                partition: partition.clone(),
                name: link.name.clone(),
                mcp_type: link.mcp_type,
                description: None,
                module_name: None,
                class_name: None,
                function_name: None,
                is_async: false,
                return_type: default_return_type(),
                schema: JsonMap::new(),
                updated_by: updated_by.to_string(),
                updated_at: now,
            });
            function.module_name = Some(link.module_name);
            function.class_name = Some(link.class_name);
            function.function_name = link.function_name;
            function.return_type = link.return_type;
            function.is_async = link.is_async;
        }

        let mut modules: BTreeMap<String, McpModule> = BTreeMap::new();
        for definition in document.modules {
            let setting_id = if definition.setting.is_empty() {
                None
            } else {
                let setting_id = class_setting_id(&definition.module_name, &definition.class_name);
                self.upsert_setting(McpSetting {
                    partition: partition.clone(),
                    setting_id: setting_id.clone(),
                    setting: definition.setting,
                    updated_by: updated_by.to_string(),
                    updated_at: now,
                })
                .await?;
                stats.settings += 1;
                Some(setting_id)
            };

            let module = modules.entry(definition.module_name.clone()).or_insert_with(|| McpModule {
                partition: partition.clone(),
                module_name: definition.module_name.clone(),
                package_name: definition.package_name.clone(),
                classes: Vec::new(),
                source_uri: None,
                updated_by: updated_by.to_string(),
                updated_at: now,
            });
            if definition.source.is_some() {
                module.source_uri = definition.source;
            }
            module.classes.retain(|class| class.class_name != definition.class_name);
            module.classes.push(ModuleClass { class_name: definition.class_name, setting_id });
        }

        stats.modules = modules.len();
        for module in modules.into_values() {
            self.upsert_module(module).await?;
        }
        for function in functions.into_values() {
            self.upsert_function(function).await?;
        }

        info!(
            partition = %partition,
            tools = stats.tools,
            resources = stats.resources,
            prompts = stats.prompts,
            modules = stats.modules,
            settings = stats.settings,
            "imported MCP configuration"
        );
        Ok(stats)
    }
}
