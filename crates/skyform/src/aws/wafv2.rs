//! WAFv2 web ACLs.
//!
//! Web ACLs are guarded by a lock token: every mutation must present the
//! token from the latest read, and AWS rejects it with
//! `WAFOptimisticLockException` when the ACL changed in the meantime.
//! Shield Advanced adds such changes on its own, inserting an AWS-managed
//! mitigation rule group, which we neither report as drift nor remove.
use std::sync::OnceLock;

use aws_sdk_wafv2::types as sdk;
use snafu::prelude::*;

use super::{
    error::{self, EmptyResultSnafu, InvalidIdSnafu, MissingFieldSnafu, ValidationSnafu},
    find,
    retry::{retry_when, with_optimistic_lock, RetryPolicy},
    AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, HasDependencies};

const NOT_FOUND: &[&str] = &["WAFNonexistentItemException"];
const LOCK_FAILURE: &[&str] = &["WAFOptimisticLockException"];
const UNAVAILABLE: &[&str] = &["WAFUnavailableEntityException"];
const DELETE_RETRYABLE: &[&str] = &["WAFAssociatedItemException", "WAFUnavailableEntityException"];

const CREATE_TIMEOUT: RetryPolicy = RetryPolicy::new(std::time::Duration::from_secs(5 * 60));
const UPDATE_TIMEOUT: RetryPolicy = RetryPolicy::new(std::time::Duration::from_secs(5 * 60));
const DELETE_TIMEOUT: RetryPolicy = RetryPolicy::new(std::time::Duration::from_secs(5 * 60));

/// Errors an UpdateWebACL call is retried on. Attempts made with a
/// refreshed lock token also retry on association changes.
fn update_retryable(refreshed_token: bool) -> &'static [&'static str] {
    if refreshed_token {
        DELETE_RETRYABLE
    } else {
        UNAVAILABLE
    }
}

fn shield_rule_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // UNWRAP: safe because the pattern is a valid literal
        regex::Regex::new(
            r"^ShieldMitigationRuleGroup_\d{12}_[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}_.*",
        )
        .unwrap()
    })
}

fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    // UNWRAP: safe because the pattern is a valid literal
    PATTERN.get_or_init(|| regex::Regex::new(r"^[0-9A-Za-z_-]+$").unwrap())
}

/// Whether `name` is a rule Shield Advanced automatic mitigation added.
pub fn is_shield_rule(name: &str) -> bool {
    shield_rule_pattern().is_match(name)
}

/// Drops Shield mitigation rules from `observed`, unless they are
/// declared in `configured`.
fn filter_shield_rules<R>(
    observed: Vec<R>,
    name: impl Fn(&R) -> &str,
    configured: &[Rule],
) -> Vec<R> {
    observed
        .into_iter()
        .filter(|rule| {
            let rule_name = name(rule);
            !is_shield_rule(rule_name) || configured.iter().any(|c| c.name == rule_name)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    #[default]
    Regional,
    /// Only available in us-east-1.
    Cloudfront,
}

impl HasDependencies for Scope {}

impl Scope {
    fn to_sdk(self) -> sdk::Scope {
        match self {
            Scope::Regional => sdk::Scope::Regional,
            Scope::Cloudfront => sdk::Scope::Cloudfront,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Scope::Regional => "REGIONAL",
            Scope::Cloudfront => "CLOUDFRONT",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "REGIONAL" => Ok(Scope::Regional),
            "CLOUDFRONT" => Ok(Scope::Cloudfront),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    #[default]
    Allow,
    Block,
}

impl HasDependencies for DefaultAction {}

impl DefaultAction {
    fn to_sdk(self) -> sdk::DefaultAction {
        let builder = sdk::DefaultAction::builder();
        match self {
            DefaultAction::Allow => builder.allow(sdk::AllowAction::builder().build()),
            DefaultAction::Block => builder.block(sdk::BlockAction::builder().build()),
        }
        .build()
    }

    fn from_sdk(action: Option<&sdk::DefaultAction>) -> Self {
        match action {
            Some(action) if action.block().is_some() => DefaultAction::Block,
            _ => DefaultAction::Allow,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Block,
    Count,
}

/// What to do with the actions of a rule group's own rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    /// Keep them.
    None,
    /// Count matches instead.
    Count,
}

#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct VisibilityConfig {
    pub metric_name: String,
    pub cloudwatch_metrics_enabled: bool,
    pub sampled_requests_enabled: bool,
}

impl VisibilityConfig {
    pub fn new(metric_name: impl Into<String>) -> Self {
        VisibilityConfig {
            metric_name: metric_name.into(),
            cloudwatch_metrics_enabled: true,
            sampled_requests_enabled: true,
        }
    }

    fn to_sdk(&self) -> Result<sdk::VisibilityConfig> {
        sdk::VisibilityConfig::builder()
            .metric_name(&self.metric_name)
            .cloud_watch_metrics_enabled(self.cloudwatch_metrics_enabled)
            .sampled_requests_enabled(self.sampled_requests_enabled)
            .build()
            .map_err(|e| Error::Validation {
                field: "visibility_config",
                reason: e.to_string(),
            })
    }

    fn from_sdk(config: &sdk::VisibilityConfig) -> Self {
        VisibilityConfig {
            metric_name: config.metric_name().to_owned(),
            cloudwatch_metrics_enabled: config.cloud_watch_metrics_enabled(),
            sampled_requests_enabled: config.sampled_requests_enabled(),
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=255).contains(&self.metric_name.len())
                && name_pattern().is_match(&self.metric_name),
            ValidationSnafu {
                field: "metric_name",
                reason: format!(
                    "'{}' must be 1-255 characters of 0-9A-Za-z_-",
                    self.metric_name
                ),
            }
        );
        Ok(())
    }
}

/// The match condition of a rule.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    ManagedRuleGroup {
        vendor_name: String,
        name: String,
        version: Option<String>,
        excluded_rules: Vec<String>,
    },
    IpSetReference {
        arn: String,
    },
    /// Rate limit per source IP, over a five minute window.
    RateBased {
        limit: i64,
    },
    GeoMatch {
        country_codes: Vec<String>,
    },
    /// A statement kind skyform doesn't manage, seen on AWS.
    Unsupported,
}

impl Statement {
    fn to_sdk(&self) -> Result<sdk::Statement> {
        let invalid = |e: aws_sdk_wafv2::error::BuildError| Error::Validation {
            field: "statement",
            reason: e.to_string(),
        };
        let builder = sdk::Statement::builder();
        let builder = match self {
            Statement::ManagedRuleGroup {
                vendor_name,
                name,
                version,
                excluded_rules,
            } => {
                let excluded = excluded_rules
                    .iter()
                    .map(|name| sdk::ExcludedRule::builder().name(name).build())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(invalid)?;
                builder.managed_rule_group_statement(
                    sdk::ManagedRuleGroupStatement::builder()
                        .vendor_name(vendor_name)
                        .name(name)
                        .set_version(version.clone())
                        .set_excluded_rules((!excluded.is_empty()).then_some(excluded))
                        .build()
                        .map_err(invalid)?,
                )
            }
            Statement::IpSetReference { arn } => builder.ip_set_reference_statement(
                sdk::IpSetReferenceStatement::builder()
                    .arn(arn)
                    .build()
                    .map_err(invalid)?,
            ),
            Statement::RateBased { limit } => builder.rate_based_statement(
                sdk::RateBasedStatement::builder()
                    .limit(*limit)
                    .aggregate_key_type(sdk::RateBasedStatementAggregateKeyType::Ip)
                    .build()
                    .map_err(invalid)?,
            ),
            Statement::GeoMatch { country_codes } => builder.geo_match_statement(
                sdk::GeoMatchStatement::builder()
                    .set_country_codes(Some(
                        country_codes
                            .iter()
                            .map(|code| sdk::CountryCode::from(code.as_str()))
                            .collect(),
                    ))
                    .build(),
            ),
            Statement::Unsupported => {
                return ValidationSnafu {
                    field: "statement",
                    reason: "unsupported statements can't be created",
                }
                .fail();
            }
        };
        Ok(builder.build())
    }

    fn from_sdk(statement: Option<&sdk::Statement>) -> Self {
        let Some(statement) = statement else {
            return Statement::Unsupported;
        };
        if let Some(group) = statement.managed_rule_group_statement() {
            Statement::ManagedRuleGroup {
                vendor_name: group.vendor_name().to_owned(),
                name: group.name().to_owned(),
                version: group.version().map(str::to_owned),
                excluded_rules: group
                    .excluded_rules()
                    .iter()
                    .map(|rule| rule.name().to_owned())
                    .collect(),
            }
        } else if let Some(ip_set) = statement.ip_set_reference_statement() {
            Statement::IpSetReference {
                arn: ip_set.arn().to_owned(),
            }
        } else if let Some(rate) = statement.rate_based_statement() {
            Statement::RateBased {
                limit: rate.limit(),
            }
        } else if let Some(geo) = statement.geo_match_statement() {
            Statement::GeoMatch {
                country_codes: geo
                    .country_codes()
                    .iter()
                    .map(|code| code.as_str().to_owned())
                    .collect(),
            }
        } else {
            Statement::Unsupported
        }
    }
}

/// A rule in a web ACL.
///
/// Exactly one of `action` and `override_action` is set, and
/// `override_action` only applies to rule group statements.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct Rule {
    pub name: String,
    pub priority: i32,
    #[sky(skip)]
    pub action: Option<RuleAction>,
    #[sky(skip)]
    pub override_action: Option<OverrideAction>,
    pub statement: Statement,
    pub visibility_config: VisibilityConfig,
}

impl Rule {
    fn to_sdk(&self) -> Result<sdk::Rule> {
        let action = self.action.map(|action| {
            let builder = sdk::RuleAction::builder();
            match action {
                RuleAction::Allow => builder.allow(sdk::AllowAction::builder().build()),
                RuleAction::Block => builder.block(sdk::BlockAction::builder().build()),
                RuleAction::Count => builder.count(sdk::CountAction::builder().build()),
            }
            .build()
        });
        let override_action = self.override_action.map(|action| {
            let builder = sdk::OverrideAction::builder();
            match action {
                OverrideAction::None => builder.none(sdk::NoneAction::builder().build()),
                OverrideAction::Count => builder.count(sdk::CountAction::builder().build()),
            }
            .build()
        });
        sdk::Rule::builder()
            .name(&self.name)
            .priority(self.priority)
            .set_action(action)
            .set_override_action(override_action)
            .statement(self.statement.to_sdk()?)
            .visibility_config(self.visibility_config.to_sdk()?)
            .build()
            .map_err(|e| Error::Validation {
                field: "rule",
                reason: e.to_string(),
            })
    }

    fn from_sdk(rule: &sdk::Rule) -> Self {
        let action = rule.action().and_then(|action| {
            if action.allow().is_some() {
                Some(RuleAction::Allow)
            } else if action.block().is_some() {
                Some(RuleAction::Block)
            } else if action.count().is_some() {
                Some(RuleAction::Count)
            } else {
                None
            }
        });
        let override_action = rule.override_action().and_then(|action| {
            if action.none().is_some() {
                Some(OverrideAction::None)
            } else if action.count().is_some() {
                Some(OverrideAction::Count)
            } else {
                None
            }
        });
        Rule {
            name: rule.name().to_owned(),
            priority: rule.priority(),
            action,
            override_action,
            statement: Statement::from_sdk(rule.statement()),
            visibility_config: rule
                .visibility_config()
                .map(VisibilityConfig::from_sdk)
                .unwrap_or_else(|| VisibilityConfig::new(rule.name())),
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            ValidationSnafu {
                field: "rule",
                reason: format!("'{}' {reason}", self.name),
            }
            .fail()
        };
        if !(1..=128).contains(&self.name.len()) || !name_pattern().is_match(&self.name) {
            return invalid("name must be 1-128 characters of 0-9A-Za-z_-".into());
        }
        let is_group = matches!(self.statement, Statement::ManagedRuleGroup { .. });
        match (self.action, self.override_action) {
            (Some(_), None) if !is_group => {}
            (None, Some(_)) if is_group => {}
            (Some(_), None) => return invalid("rule groups take an override_action".into()),
            (None, Some(_)) => return invalid("only rule groups take an override_action".into()),
            _ => return invalid("must set exactly one of action and override_action".into()),
        }
        match &self.statement {
            Statement::RateBased { limit } if !(10..=2_000_000_000).contains(limit) => {
                return invalid(format!("rate limit {limit} must be within 10-2000000000"));
            }
            Statement::GeoMatch { country_codes } if country_codes.is_empty() => {
                return invalid("geo match needs at least one country code".into());
            }
            Statement::Unsupported => return invalid("has an unsupported statement".into()),
            _ => {}
        }
        self.visibility_config.validate()
    }
}

/// The three values that identify a web ACL to the WAFv2 API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebAclKey {
    pub id: String,
    pub name: String,
    pub scope: Scope,
}

/// Parses an import id of the form `ID/NAME/SCOPE`.
impl std::str::FromStr for WebAclKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || InvalidIdSnafu {
            id: s,
            expected: "ID/NAME/SCOPE",
        };
        let parts = s.split('/').collect::<Vec<_>>();
        let [id, name, scope] = parts.as_slice() else {
            return invalid().fail();
        };
        ensure!(!id.is_empty() && !name.is_empty(), invalid());
        let scope = scope.parse::<Scope>().ok().context(invalid())?;
        Ok(WebAclKey {
            id: id.to_string(),
            name: name.to_string(),
            scope,
        })
    }
}

impl std::fmt::Display for WebAclKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.id, self.name, self.scope.as_str())
    }
}

impl WebAclKey {
    async fn get(&self, client: &aws_sdk_wafv2::Client) -> Result<aws_sdk_wafv2::operation::get_web_acl::GetWebAclOutput> {
        let output = client
            .get_web_acl()
            .id(&self.id)
            .name(&self.name)
            .scope(self.scope.to_sdk())
            .send()
            .await
            .map_err(error::api_or_missing("GetWebACL", NOT_FOUND))?;
        ensure!(
            output.web_acl().is_some(),
            EmptyResultSnafu {
                operation: "GetWebACL"
            }
        );
        Ok(output)
    }

    async fn lock_token(&self, client: &aws_sdk_wafv2::Client) -> Result<String> {
        let output = self.get(client).await?;
        output.lock_token().map(str::to_owned).context(MissingFieldSnafu {
            operation: "GetWebACL",
            field: "LockToken",
        })
    }
}

/// A WAFv2 web ACL.
#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct WebAcl {
    pub name: String,
    pub scope: Scope,
    pub description: Option<String>,
    pub default_action: DefaultAction,
    pub rules: Vec<Rule>,
    pub visibility_config: VisibilityConfig,
    pub tags: Tags,
}

/// The observed state of a web ACL.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct WebAclOutput {
    pub id: String,
    pub arn: String,
    pub lock_token: String,
    /// Web ACL capacity units used by the rules.
    pub capacity: i64,
    pub description: Option<String>,
    pub default_action: DefaultAction,
    /// Rules, without Shield mitigation rules we don't manage.
    pub rules: Vec<Rule>,
    pub visibility_config: VisibilityConfig,
    pub tags_all: Tags,
}

/// `lock_token` and `capacity` are computed by AWS and change with
/// out-of-band writes such as Shield mitigation rules, so they aren't
/// compared.
impl PartialEq for WebAclOutput {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.arn == other.arn
            && self.description == other.description
            && self.default_action == other.default_action
            && self.rules == other.rules
            && self.visibility_config == other.visibility_config
            && self.tags_all == other.tags_all
    }
}

impl WebAcl {
    fn client(provider: &AwsProvider) -> aws_sdk_wafv2::Client {
        aws_sdk_wafv2::Client::new(provider.sdk())
    }

    fn sdk_rules(&self) -> Result<Vec<sdk::Rule>> {
        self.rules.iter().map(Rule::to_sdk).collect()
    }

    /// Finds the id of the web ACL with this name and scope.
    async fn find_id(&self, client: &aws_sdk_wafv2::Client) -> Result<String> {
        let summaries = find::collect_pages(move |marker| {
            let request = client
                .list_web_acls()
                .scope(self.scope.to_sdk())
                .limit(100)
                .set_next_marker(marker);
            async move {
                let output = request.send().await.map_err(error::api("ListWebACLs"))?;
                Ok((
                    output.web_acls().to_vec(),
                    output.next_marker().map(str::to_owned),
                ))
            }
        })
        .await?;
        let matching = summaries
            .into_iter()
            .filter(|summary| summary.name() == Some(self.name.as_str()))
            .collect();
        let summary = find::assert_single_value("ListWebACLs", matching)?;
        summary.id().map(str::to_owned).context(MissingFieldSnafu {
            operation: "ListWebACLs",
            field: "Id",
        })
    }

    fn key(&self, id: &str) -> WebAclKey {
        WebAclKey {
            id: id.to_owned(),
            name: self.name.clone(),
            scope: self.scope,
        }
    }

    /// Reads the web ACL identified by `key`, keeping Shield rules only if
    /// `configured` declares them.
    async fn read_key(
        provider: &AwsProvider,
        client: &aws_sdk_wafv2::Client,
        key: &WebAclKey,
        configured: &[Rule],
    ) -> Result<WebAclOutput> {
        let output = key.get(client).await?;
        let acl = output.web_acl().context(EmptyResultSnafu {
            operation: "GetWebACL",
        })?;
        let rules = filter_shield_rules(acl.rules().to_vec(), |r| r.name(), configured);
        let tags = client
            .list_tags_for_resource()
            .resource_arn(acl.arn())
            .send()
            .await
            .map_err(error::api_or_missing("ListTagsForResource", NOT_FOUND))?;
        let tags = tags
            .tag_info_for_resource()
            .map(|info| Tags::from_wafv2(info.tag_list()))
            .unwrap_or_default();
        Ok(WebAclOutput {
            id: acl.id().to_owned(),
            arn: acl.arn().to_owned(),
            lock_token: output.lock_token().unwrap_or_default().to_owned(),
            capacity: acl.capacity(),
            description: acl.description().map(str::to_owned),
            default_action: DefaultAction::from_sdk(acl.default_action()),
            rules: rules.iter().map(Rule::from_sdk).collect(),
            visibility_config: acl
                .visibility_config()
                .map(VisibilityConfig::from_sdk)
                .unwrap_or_else(|| VisibilityConfig::new(acl.name())),
            tags_all: provider.observed_tags(tags),
        })
    }

    /// Reads an existing web ACL by its `ID/NAME/SCOPE` import id.
    ///
    /// Returns a local definition matching it along with its remote state,
    /// ready to be handed to [`crate::Store::load`].
    pub async fn import(provider: &AwsProvider, import_id: &str) -> Result<(Self, WebAclOutput)> {
        let key: WebAclKey = import_id.parse()?;
        let client = Self::client(provider);
        let output = Self::read_key(provider, &client, &key, &[]).await?;
        let local = WebAcl {
            name: key.name,
            scope: key.scope,
            description: output.description.clone(),
            default_action: output.default_action,
            rules: output.rules.clone(),
            visibility_config: output.visibility_config.clone(),
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }

    fn config_differs(&self, observed: &WebAclOutput) -> bool {
        self.description != observed.description
            || self.default_action != observed.default_action
            || self.rules != observed.rules
            || self.visibility_config != observed.visibility_config
    }
}

impl sky::Resource for WebAcl {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = WebAclOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &Self::client(provider);
        let rules = self.sdk_rules()?;
        let visibility_config = self.visibility_config.to_sdk()?;
        let tags = provider.tags_all(&self.tags).to_wafv2()?;
        let output = retry_when(
            "WAFv2 WebACL creation",
            CREATE_TIMEOUT,
            |e| e.has_code(UNAVAILABLE),
            move || {
                let request = client
                    .create_web_acl()
                    .name(&self.name)
                    .scope(self.scope.to_sdk())
                    .default_action(self.default_action.to_sdk())
                    .set_description(self.description.clone())
                    .set_rules(Some(rules.clone()))
                    .visibility_config(visibility_config.clone())
                    .set_tags((!tags.is_empty()).then(|| tags.clone()));
                async move { request.send().await.map_err(error::api("CreateWebACL")) }
            },
        )
        .await?;
        let id = output
            .summary()
            .and_then(|summary| summary.id())
            .context(MissingFieldSnafu {
                operation: "CreateWebACL",
                field: "Summary.Id",
            })?;
        log::info!("created WAFv2 WebACL {}", self.key(id));
        Self::read_key(provider, client, &self.key(id), &self.rules).await
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = Self::client(provider);
        let id = self.find_id(&client).await?;
        Self::read_key(provider, &client, &self.key(&id), &self.rules).await
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = Self::client(provider);
        let key = self.key(&previous_remote.id);
        Self::read_key(provider, &client, &key, &self.rules).await
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = &Self::client(provider);
        let key = &self.key(&previous_remote.id);

        if self.config_differs(previous_remote) {
            let mut rules = self.sdk_rules()?;
            if !rules.iter().any(|rule| is_shield_rule(rule.name())) {
                let current = key.get(client).await?;
                let shield_rules = current
                    .web_acl()
                    .map(|acl| acl.rules())
                    .unwrap_or_default()
                    .iter()
                    .filter(|rule| is_shield_rule(rule.name()))
                    .cloned()
                    .collect::<Vec<_>>();
                if !shield_rules.is_empty() {
                    log::debug!("keeping {} Shield mitigation rule(s)", shield_rules.len());
                }
                rules.extend(shield_rules);
            }
            let visibility_config = self.visibility_config.to_sdk()?;
            let request = client
                .update_web_acl()
                .id(&key.id)
                .name(&key.name)
                .scope(key.scope.to_sdk())
                .default_action(self.default_action.to_sdk())
                .set_description(self.description.clone())
                .set_rules(Some(rules))
                .visibility_config(visibility_config);
            with_optimistic_lock(
                "WAFv2 WebACL",
                &previous_remote.lock_token,
                |e| e.has_code(LOCK_FAILURE),
                |token| {
                    let retryable = update_retryable(token != previous_remote.lock_token);
                    let request = request.clone().lock_token(token);
                    retry_when(
                        "WAFv2 WebACL update",
                        UPDATE_TIMEOUT,
                        move |e| e.has_code(retryable),
                        move || {
                            let request = request.clone();
                            async move { request.send().await.map_err(error::api("UpdateWebACL")) }
                        },
                    )
                },
                move || key.lock_token(client),
            )
            .await?;
        }

        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .untag_resource()
                .resource_arn(&previous_remote.arn)
                .set_tag_keys(Some(tags.to_remove.clone()))
                .send()
                .await
                .map_err(error::api("UntagResource"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .tag_resource()
                .resource_arn(&previous_remote.arn)
                .set_tags(Some(tags.to_set.to_wafv2()?))
                .send()
                .await
                .map_err(error::api("TagResource"))?;
        }

        Self::read_key(provider, client, key, &self.rules).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        let client = &Self::client(provider);
        let key = &self.key(&previous_remote.id);
        log::info!("deleting WAFv2 WebACL {key}");
        let result = with_optimistic_lock(
            "WAFv2 WebACL",
            &previous_remote.lock_token,
            |e| e.has_code(LOCK_FAILURE),
            |token| {
                let request = client
                    .delete_web_acl()
                    .id(&key.id)
                    .name(&key.name)
                    .scope(key.scope.to_sdk())
                    .lock_token(token);
                retry_when(
                    "WAFv2 WebACL deletion",
                    DELETE_TIMEOUT,
                    |e| e.has_code(DELETE_RETRYABLE),
                    move || {
                        let request = request.clone();
                        async move {
                            request
                                .send()
                                .await
                                .map(|_| ())
                                .map_err(error::api_or_missing("DeleteWebACL", NOT_FOUND))
                        }
                    },
                )
            },
            move || key.lock_token(client),
        )
        .await;
        error::ignore_missing(result)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=128).contains(&self.name.len()) && name_pattern().is_match(&self.name),
            ValidationSnafu {
                field: "name",
                reason: format!("'{}' must be 1-128 characters of 0-9A-Za-z_-", self.name),
            }
        );
        if let Some(description) = &self.description {
            ensure!(
                (1..=256).contains(&description.chars().count()),
                ValidationSnafu {
                    field: "description",
                    reason: "must be 1-256 characters",
                }
            );
        }
        self.visibility_config.validate()?;
        let mut names = std::collections::BTreeSet::new();
        let mut priorities = std::collections::BTreeSet::new();
        for rule in &self.rules {
            rule.validate()?;
            ensure!(
                names.insert(rule.name.as_str()),
                ValidationSnafu {
                    field: "rule",
                    reason: format!("duplicate rule name '{}'", rule.name),
                }
            );
            ensure!(
                priorities.insert(rule.priority),
                ValidationSnafu {
                    field: "rule",
                    reason: format!("duplicate rule priority {}", rule.priority),
                }
            );
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.name != previous.name || self.scope != previous.scope
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Resource;
    use pretty_assertions::assert_eq;

    const SHIELD_RULE: &str =
        "ShieldMitigationRuleGroup_123456789012_5e665b2c-4d1b-4b2b-9c2a-8e9f3f9d2a1b_uniqueid";

    fn managed_rule(name: &str, priority: i32) -> Rule {
        Rule {
            name: name.into(),
            priority,
            action: None,
            override_action: Some(OverrideAction::None),
            statement: Statement::ManagedRuleGroup {
                vendor_name: "AWS".into(),
                name: "AWSManagedRulesCommonRuleSet".into(),
                version: None,
                excluded_rules: vec!["SizeRestrictions_BODY".into()],
            },
            visibility_config: VisibilityConfig::new(name),
        }
    }

    fn web_acl() -> WebAcl {
        WebAcl {
            name: "edge-acl".into(),
            scope: Scope::Regional,
            description: Some("edge".into()),
            default_action: DefaultAction::Allow,
            rules: vec![
                managed_rule("common", 1),
                Rule {
                    name: "throttle".into(),
                    priority: 2,
                    action: Some(RuleAction::Block),
                    override_action: None,
                    statement: Statement::RateBased { limit: 2000 },
                    visibility_config: VisibilityConfig::new("throttle"),
                },
            ],
            visibility_config: VisibilityConfig::new("edge-acl"),
            tags: Tags::new().with("app", "edge"),
        }
    }

    #[test]
    fn shield_rule_names() {
        assert!(is_shield_rule(SHIELD_RULE));
        assert!(!is_shield_rule("ShieldMitigationRuleGroup_123_abc_x"));
        assert!(!is_shield_rule("common"));
    }

    #[test]
    fn shield_rules_are_filtered_unless_configured() {
        let observed = vec!["common".to_owned(), SHIELD_RULE.to_owned()];
        assert_eq!(
            vec!["common".to_owned()],
            filter_shield_rules(observed.clone(), |r| r.as_str(), &web_acl().rules)
        );

        let mut configured = web_acl().rules;
        configured.push(managed_rule(SHIELD_RULE, 10));
        assert_eq!(
            observed.clone(),
            filter_shield_rules(observed, |r| r.as_str(), &configured)
        );
    }

    #[test]
    fn import_id_round_trip() {
        let key: WebAclKey = "a1b2/edge-acl/REGIONAL".parse().unwrap();
        assert_eq!(
            WebAclKey {
                id: "a1b2".into(),
                name: "edge-acl".into(),
                scope: Scope::Regional,
            },
            key
        );
        assert_eq!("a1b2/edge-acl/REGIONAL", key.to_string());

        for bad in ["a1b2/edge-acl", "a1b2/edge-acl/GLOBAL", "/edge-acl/REGIONAL", "a/b/c/d"] {
            let error = bad.parse::<WebAclKey>().unwrap_err();
            assert!(
                error.to_string().contains("ID/NAME/SCOPE"),
                "{bad}: {error}"
            );
        }
    }

    #[test]
    fn rules_convert_to_and_from_sdk() {
        for rule in web_acl().rules {
            let sdk_rule = rule.to_sdk().unwrap();
            assert_eq!(rule, Rule::from_sdk(&sdk_rule));
        }
        let geo = Rule {
            name: "geo".into(),
            priority: 3,
            action: Some(RuleAction::Count),
            override_action: None,
            statement: Statement::GeoMatch {
                country_codes: vec!["NZ".into(), "AU".into()],
            },
            visibility_config: VisibilityConfig::new("geo"),
        };
        assert_eq!(geo, Rule::from_sdk(&geo.to_sdk().unwrap()));
    }

    #[test]
    fn validation() {
        assert!(web_acl().validate().is_ok());

        let mut acl = web_acl();
        acl.name = "has space".into();
        assert!(acl.validate().is_err());

        let mut acl = web_acl();
        acl.description = Some("x".repeat(257));
        assert!(acl.validate().is_err());

        let mut acl = web_acl();
        acl.rules[1].priority = 1;
        let error = acl.validate().unwrap_err();
        assert!(error.to_string().contains("duplicate rule priority"), "{error}");

        let mut acl = web_acl();
        acl.rules[0].action = Some(RuleAction::Block);
        assert!(acl.validate().is_err());

        let mut acl = web_acl();
        acl.rules[1].override_action = Some(OverrideAction::Count);
        acl.rules[1].action = None;
        assert!(acl.validate().is_err());

        let mut acl = web_acl();
        acl.rules[1].statement = Statement::RateBased { limit: 1 };
        assert!(acl.validate().is_err());
    }

    #[test]
    fn name_and_scope_force_replacement() {
        let acl = web_acl();
        let mut renamed = acl.clone();
        renamed.name = "renamed".into();
        assert!(renamed.requires_replacement(&acl));

        let mut global = acl.clone();
        global.scope = Scope::Cloudfront;
        assert!(global.requires_replacement(&acl));

        let mut described = acl.clone();
        described.description = None;
        assert!(!described.requires_replacement(&acl));
    }

    #[test]
    fn definition_is_compared_with_observed_config() {
        let acl = web_acl();
        let observed = WebAclOutput {
            id: "id".into(),
            arn: "arn".into(),
            lock_token: "token".into(),
            capacity: 700,
            description: acl.description.clone(),
            default_action: acl.default_action,
            rules: acl.rules.clone(),
            visibility_config: acl.visibility_config.clone(),
            tags_all: Tags::new(),
        };
        assert!(!acl.config_differs(&observed));
        let blocked = WebAclOutput {
            default_action: DefaultAction::Block,
            ..observed
        };
        assert!(acl.config_differs(&blocked));
    }

    #[test]
    fn lock_token_and_capacity_are_not_drift() {
        let acl = web_acl();
        let stored = WebAclOutput {
            id: "id".into(),
            arn: "arn".into(),
            lock_token: "t1".into(),
            capacity: 700,
            description: acl.description.clone(),
            default_action: acl.default_action,
            rules: acl.rules.clone(),
            visibility_config: acl.visibility_config.clone(),
            tags_all: Tags::new().with("app", "edge"),
        };
        let after_shield = WebAclOutput {
            lock_token: "t2".into(),
            capacity: 750,
            ..stored.clone()
        };
        assert_eq!(stored, after_shield);

        let retagged = WebAclOutput {
            tags_all: Tags::new(),
            ..after_shield
        };
        assert_ne!(stored, retagged);
    }

    #[test]
    fn refreshed_token_updates_also_retry_on_associations() {
        assert_eq!(UNAVAILABLE, update_retryable(false));
        assert!(!update_retryable(false).contains(&"WAFAssociatedItemException"));
        assert!(update_retryable(true).contains(&"WAFAssociatedItemException"));
        assert!(update_retryable(true).contains(&"WAFUnavailableEntityException"));
    }
}
