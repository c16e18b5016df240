//! EC2 customer gateways and transit gateway lookups.
use std::{collections::BTreeMap, time::Duration};

use aws_sdk_ec2::types::{Filter, GatewayType, ResourceType, TagSpecification};
use snafu::prelude::*;

use super::{
    error::{self, MissingFieldSnafu, ValidationSnafu},
    find::{self, CustomFilter},
    retry::{wait_until, RetryPolicy, Status},
    AwsProvider, Error, Result, Tags,
};
use crate::{self as sky, HasDependencies};

const CUSTOMER_GATEWAY_NOT_FOUND: &[&str] = &["InvalidCustomerGatewayID.NotFound"];
const TRANSIT_GATEWAY_ATTACHMENT_NOT_FOUND: &[&str] = &["InvalidTransitGatewayAttachmentID.NotFound"];
const MULTICAST_DOMAIN_NOT_FOUND: &[&str] = &["InvalidTransitGatewayMulticastDomainId.NotFound"];

const GATEWAY_DELETED_STATES: &[&str] = &["deleted"];

const CUSTOMER_GATEWAY_TIMEOUT: RetryPolicy = RetryPolicy::new(Duration::from_secs(10 * 60))
    .with_delays(Duration::from_secs(2), Duration::from_secs(15));

const MAX_ASN: i64 = 4_294_967_294;

fn client(provider: &AwsProvider) -> aws_sdk_ec2::Client {
    aws_sdk_ec2::Client::new(provider.sdk())
}

/// Splits an ASN into the `BgpAsn` or `BgpAsnExtended` request parameter.
///
/// ASNs above 2147483647 only fit the extended parameter.
fn asn_params(asn: i64) -> (Option<i32>, Option<i64>) {
    match i32::try_from(asn) {
        Ok(asn) => (Some(asn), None),
        Err(_) => (None, Some(asn)),
    }
}

/// Picks the customer gateway with `id` out of a describe result.
///
/// Deleted gateways stay visible for a while, and a describe right after
/// a create may not see the new gateway yet. Both count as not found.
fn customer_gateway_by_id(
    id: &str,
    gateways: Vec<aws_sdk_ec2::types::CustomerGateway>,
) -> Result<aws_sdk_ec2::types::CustomerGateway> {
    let gateway = find::assert_single_value("DescribeCustomerGateways", gateways)?;
    find::ensure_not_deleted("EC2 customer gateway", gateway.state(), GATEWAY_DELETED_STATES)?;
    find::ensure_id_matches("EC2 customer gateway", id, gateway.customer_gateway_id())?;
    Ok(gateway)
}

/// A customer gateway: AWS's record of the on-premises end of a VPN.
#[derive(Debug, Clone, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct CustomerGateway {
    pub bgp_asn: i64,
    /// The public IP address of the device.
    pub ip_address: Option<String>,
    pub certificate_arn: Option<String>,
    pub device_name: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CustomerGatewayOutput {
    pub id: String,
    pub bgp_asn: String,
    pub ip_address: Option<String>,
    pub certificate_arn: Option<String>,
    pub device_name: Option<String>,
    pub gateway_type: Option<String>,
    pub tags_all: Tags,
}

impl CustomerGatewayOutput {
    fn from_sdk(provider: &AwsProvider, gateway: &aws_sdk_ec2::types::CustomerGateway) -> Result<Self> {
        let id = gateway.customer_gateway_id().context(MissingFieldSnafu {
            operation: "DescribeCustomerGateways",
            field: "CustomerGatewayId",
        })?;
        Ok(CustomerGatewayOutput {
            id: id.to_owned(),
            bgp_asn: gateway
                .bgp_asn_extended()
                .or(gateway.bgp_asn())
                .unwrap_or_default()
                .to_owned(),
            ip_address: gateway.ip_address().map(str::to_owned),
            certificate_arn: gateway.certificate_arn().map(str::to_owned),
            device_name: gateway.device_name().map(str::to_owned),
            gateway_type: gateway.r#type().map(str::to_owned),
            tags_all: provider.observed_tags(Tags::from_ec2(gateway.tags())),
        })
    }
}

impl CustomerGateway {
    async fn describe_id(
        client: &aws_sdk_ec2::Client,
        id: &str,
    ) -> Result<aws_sdk_ec2::types::CustomerGateway> {
        let output = client
            .describe_customer_gateways()
            .customer_gateway_ids(id)
            .send()
            .await
            .map_err(error::api_or_missing(
                "DescribeCustomerGateways",
                CUSTOMER_GATEWAY_NOT_FOUND,
            ))?;
        customer_gateway_by_id(id, output.customer_gateways().to_vec())
    }

    async fn read_id(
        provider: &AwsProvider,
        client: &aws_sdk_ec2::Client,
        id: &str,
    ) -> Result<CustomerGatewayOutput> {
        let gateway = Self::describe_id(client, id).await?;
        CustomerGatewayOutput::from_sdk(provider, &gateway)
    }

    fn lookup_filters(&self) -> Vec<Filter> {
        let mut attributes = BTreeMap::from([
            ("bgp-asn", self.bgp_asn.to_string()),
            ("type", GatewayType::Ipsec1.as_str().to_owned()),
        ]);
        if let Some(ip_address) = &self.ip_address {
            attributes.insert("ip-address", ip_address.clone());
        }
        find::attribute_filters(&attributes)
    }

    /// Reads an existing customer gateway by id.
    pub async fn import(provider: &AwsProvider, id: &str) -> Result<(Self, CustomerGatewayOutput)> {
        let output = Self::read_id(provider, &client(provider), id).await?;
        let bgp_asn = output.bgp_asn.parse().map_err(|_| {
            ValidationSnafu {
                field: "bgp_asn",
                reason: format!("'{}' is not a number", output.bgp_asn),
            }
            .build()
        })?;
        let local = CustomerGateway {
            bgp_asn,
            ip_address: output.ip_address.clone(),
            certificate_arn: output.certificate_arn.clone(),
            device_name: output.device_name.clone(),
            tags: output.tags_all.remove_defaults(provider.default_tags()),
        };
        Ok((local, output))
    }
}

impl sky::Resource for CustomerGateway {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = CustomerGatewayOutput;

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let (bgp_asn, bgp_asn_extended) = asn_params(self.bgp_asn);
        let tags = provider.tags_all(&self.tags);
        let mut request = client
            .create_customer_gateway()
            .r#type(GatewayType::Ipsec1)
            .set_bgp_asn(bgp_asn)
            .set_bgp_asn_extended(bgp_asn_extended)
            .set_ip_address(self.ip_address.clone())
            .set_certificate_arn(self.certificate_arn.clone())
            .set_device_name(self.device_name.clone());
        if !tags.is_empty() {
            request = request.tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::CustomerGateway)
                    .set_tags(Some(tags.to_ec2()))
                    .build(),
            );
        }
        let output = request
            .send()
            .await
            .map_err(error::api("CreateCustomerGateway"))?;
        let id = output
            .customer_gateway()
            .and_then(|gateway| gateway.customer_gateway_id())
            .context(MissingFieldSnafu {
                operation: "CreateCustomerGateway",
                field: "CustomerGateway.CustomerGatewayId",
            })?;
        log::info!("created EC2 customer gateway {id}");

        let gateway = wait_until("EC2 customer gateway", CUSTOMER_GATEWAY_TIMEOUT, || async move {
            match Self::describe_id(client, id).await {
                // Not visible yet.
                Err(e) if e.is_not_found() => Ok(Status::Pending("not found".to_owned())),
                Err(e) => Err(e),
                Ok(gateway) if gateway.state() == Some("available") => Ok(Status::Ready(gateway)),
                Ok(gateway) => Ok(Status::Pending(
                    gateway.state().unwrap_or("unknown").to_owned(),
                )),
            }
        })
        .await?;
        CustomerGatewayOutput::from_sdk(provider, &gateway)
    }

    /// Finds the gateway with this ASN and IP address.
    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let output = client(provider)
            .describe_customer_gateways()
            .set_filters(Some(self.lookup_filters()))
            .send()
            .await
            .map_err(error::api("DescribeCustomerGateways"))?;
        let live = output
            .customer_gateways()
            .iter()
            .filter(|gateway| {
                !gateway
                    .state()
                    .is_some_and(|state| GATEWAY_DELETED_STATES.contains(&state) || state == "deleting")
            })
            .cloned()
            .collect();
        let gateway = find::assert_single_value("DescribeCustomerGateways", live)?;
        CustomerGatewayOutput::from_sdk(provider, &gateway)
    }

    async fn refresh(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        Self::read_id(provider, &client(provider), &previous_remote.id).await
    }

    /// Only tags change in place.
    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output> {
        let client = client(provider);
        let id = previous_remote.id.as_str();
        let tags = previous_remote.tags_all.diff(&provider.tags_all(&self.tags));
        if !tags.to_remove.is_empty() {
            client
                .delete_tags()
                .resources(id)
                .set_tags(Some(
                    tags.to_remove
                        .iter()
                        .map(|key| aws_sdk_ec2::types::Tag::builder().key(key).build())
                        .collect(),
                ))
                .send()
                .await
                .map_err(error::api("DeleteTags"))?;
        }
        if !tags.to_set.is_empty() {
            client
                .create_tags()
                .resources(id)
                .set_tags(Some(tags.to_set.to_ec2()))
                .send()
                .await
                .map_err(error::api("CreateTags"))?;
        }
        Self::read_id(provider, &client, id).await
    }

    async fn delete(&self, provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        let client = &client(provider);
        let id = previous_remote.id.as_str();
        log::info!("deleting EC2 customer gateway {id}");
        let result = client
            .delete_customer_gateway()
            .customer_gateway_id(id)
            .send()
            .await
            .map(|_| ())
            .map_err(error::api_or_missing(
                "DeleteCustomerGateway",
                CUSTOMER_GATEWAY_NOT_FOUND,
            ));
        error::ignore_missing(result)?;

        wait_until("EC2 customer gateway deletion", CUSTOMER_GATEWAY_TIMEOUT, || async move {
            match Self::describe_id(client, id).await {
                Err(e) if e.is_not_found() => Ok(Status::Ready(())),
                Err(e) => Err(e),
                Ok(gateway) => Ok(Status::Pending(
                    gateway.state().unwrap_or("unknown").to_owned(),
                )),
            }
        })
        .await
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_ASN).contains(&self.bgp_asn),
            ValidationSnafu {
                field: "bgp_asn",
                reason: format!("{} is not between 1 and {MAX_ASN}", self.bgp_asn),
            }
        );
        if let Some(ip_address) = &self.ip_address {
            ensure!(
                ip_address.parse::<std::net::Ipv4Addr>().is_ok(),
                ValidationSnafu {
                    field: "ip_address",
                    reason: format!("'{ip_address}' is not an IPv4 address"),
                }
            );
        }
        ensure!(
            self.ip_address.is_some() || self.certificate_arn.is_some(),
            ValidationSnafu {
                field: "ip_address",
                reason: "either ip_address or certificate_arn is required",
            }
        );
        if let Some(device_name) = &self.device_name {
            ensure!(
                device_name.len() <= 255,
                ValidationSnafu {
                    field: "device_name",
                    reason: "must be at most 255 characters",
                }
            );
        }
        Ok(())
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.bgp_asn != previous.bgp_asn
            || self.ip_address != previous.ip_address
            || self.certificate_arn != previous.certificate_arn
            || self.device_name != previous.device_name
    }

    fn is_missing(error: &Self::Error) -> bool {
        error.is_not_found()
    }
}

/// Looks up the transit gateway attachment of a site-to-site VPN
/// connection.
#[derive(Debug, Clone, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayVpnAttachment {
    pub transit_gateway_id: Option<String>,
    pub vpn_connection_id: Option<String>,
    /// Only match attachments carrying all of these tags.
    pub tags: Tags,
    pub filters: Vec<CustomFilter>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayVpnAttachmentOutput {
    pub id: String,
    pub transit_gateway_id: Option<String>,
    pub vpn_connection_id: Option<String>,
    pub tags: Tags,
}

impl TransitGatewayVpnAttachment {
    fn filters(&self) -> Vec<Filter> {
        let mut attributes = BTreeMap::from([("resource-type", "vpn".to_owned())]);
        if let Some(id) = &self.vpn_connection_id {
            attributes.insert("resource-id", id.clone());
        }
        if let Some(id) = &self.transit_gateway_id {
            attributes.insert("transit-gateway-id", id.clone());
        }
        let mut filters = find::attribute_filters(&attributes);
        filters.extend(find::custom_filters(&self.filters));
        filters.extend(find::tag_filters(&self.tags));
        filters
    }
}

impl sky::Resource for TransitGatewayVpnAttachment {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = TransitGatewayVpnAttachmentOutput;

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let filters = self.filters();
        let attachments = find::collect_pages(move |token| {
            let request = client
                .describe_transit_gateway_attachments()
                .set_filters(Some(filters.clone()))
                .set_next_token(token);
            async move {
                let output = request.send().await.map_err(error::api_or_missing(
                    "DescribeTransitGatewayAttachments",
                    TRANSIT_GATEWAY_ATTACHMENT_NOT_FOUND,
                ))?;
                Ok((
                    output.transit_gateway_attachments().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        let attachment = find::assert_single_value("DescribeTransitGatewayAttachments", attachments)?;
        Ok(TransitGatewayVpnAttachmentOutput {
            id: attachment
                .transit_gateway_attachment_id()
                .context(MissingFieldSnafu {
                    operation: "DescribeTransitGatewayAttachments",
                    field: "TransitGatewayAttachmentId",
                })?
                .to_owned(),
            transit_gateway_id: attachment.transit_gateway_id().map(str::to_owned),
            vpn_connection_id: attachment.resource_id().map(str::to_owned),
            tags: provider.observed_tags(Tags::from_ec2(attachment.tags())),
        })
    }

    /// A lookup owns nothing, so there is nothing to delete.
    async fn delete(&self, _provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!("forgetting transit gateway VPN attachment {}", previous_remote.id);
        Ok(())
    }
}

/// Looks up a transit gateway Connect attachment.
#[derive(Debug, Clone, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayConnect {
    /// The Connect attachment id.
    pub transit_gateway_connect_id: Option<String>,
    pub filters: Vec<CustomFilter>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayConnectOutput {
    pub transit_gateway_connect_id: String,
    pub transit_gateway_id: Option<String>,
    pub transport_attachment_id: Option<String>,
    pub protocol: Option<String>,
    pub tags: Tags,
}

impl sky::Resource for TransitGatewayConnect {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = TransitGatewayConnectOutput;

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let filters = find::custom_filters(&self.filters);
        let ids = self.transit_gateway_connect_id.clone().map(|id| vec![id]);
        let connects = find::collect_pages(move |token| {
            let request = client
                .describe_transit_gateway_connects()
                .set_transit_gateway_attachment_ids(ids.clone())
                .set_filters((!filters.is_empty()).then(|| filters.clone()))
                .set_next_token(token);
            async move {
                let output = request.send().await.map_err(error::api_or_missing(
                    "DescribeTransitGatewayConnects",
                    TRANSIT_GATEWAY_ATTACHMENT_NOT_FOUND,
                ))?;
                Ok((
                    output.transit_gateway_connects().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        let connect = find::assert_single_value("DescribeTransitGatewayConnects", connects)?;
        let id = connect
            .transit_gateway_attachment_id()
            .context(MissingFieldSnafu {
                operation: "DescribeTransitGatewayConnects",
                field: "TransitGatewayAttachmentId",
            })?;
        if let Some(requested) = &self.transit_gateway_connect_id {
            find::ensure_id_matches("EC2 transit gateway connect", requested, Some(id))?;
        }
        Ok(TransitGatewayConnectOutput {
            transit_gateway_connect_id: id.to_owned(),
            transit_gateway_id: connect.transit_gateway_id().map(str::to_owned),
            transport_attachment_id: connect
                .transport_transit_gateway_attachment_id()
                .map(str::to_owned),
            protocol: connect
                .options()
                .and_then(|options| options.protocol())
                .map(|protocol| protocol.as_str().to_owned()),
            tags: provider.observed_tags(Tags::from_ec2(connect.tags())),
        })
    }

    async fn delete(&self, _provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!(
            "forgetting transit gateway connect {}",
            previous_remote.transit_gateway_connect_id
        );
        Ok(())
    }
}

/// A subnet associated with a multicast domain.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MulticastDomainAssociation {
    pub subnet_id: Option<String>,
    pub transit_gateway_attachment_id: Option<String>,
}

impl MulticastDomainAssociation {
    fn from_sdk(association: &aws_sdk_ec2::types::TransitGatewayMulticastDomainAssociation) -> Self {
        MulticastDomainAssociation {
            subnet_id: association
                .subnet()
                .and_then(|subnet| subnet.subnet_id())
                .map(str::to_owned),
            transit_gateway_attachment_id: association
                .transit_gateway_attachment_id()
                .map(str::to_owned),
        }
    }
}

/// A network interface registered in a multicast group.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MulticastGroup {
    pub group_ip_address: Option<String>,
    pub network_interface_id: Option<String>,
}

impl MulticastGroup {
    fn from_sdk(group: &aws_sdk_ec2::types::TransitGatewayMulticastGroup) -> Self {
        MulticastGroup {
            group_ip_address: group.group_ip_address().map(str::to_owned),
            network_interface_id: group.network_interface_id().map(str::to_owned),
        }
    }
}

/// Whether to search a multicast domain's group members or its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupRole {
    Member,
    Source,
}

impl GroupRole {
    fn filters(self) -> Vec<Filter> {
        let member = self == GroupRole::Member;
        find::attribute_filters(&BTreeMap::from([
            ("is-group-member", member.to_string()),
            ("is-group-source", (!member).to_string()),
        ]))
    }
}

/// Looks up a transit gateway multicast domain, along with its subnet
/// associations, group members and group sources.
#[derive(Debug, Clone, Default, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayMulticastDomain {
    pub transit_gateway_multicast_domain_id: Option<String>,
    pub filters: Vec<CustomFilter>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransitGatewayMulticastDomainOutput {
    pub transit_gateway_multicast_domain_id: String,
    pub arn: Option<String>,
    pub owner_id: Option<String>,
    pub state: Option<String>,
    pub transit_gateway_id: Option<String>,
    pub auto_accept_shared_associations: Option<String>,
    pub igmpv2_support: Option<String>,
    pub static_sources_support: Option<String>,
    pub tags: Tags,
    pub associations: Vec<MulticastDomainAssociation>,
    pub members: Vec<MulticastGroup>,
    pub sources: Vec<MulticastGroup>,
}

impl TransitGatewayMulticastDomainOutput {
    /// The domain's own attributes, without associations and groups.
    fn from_sdk(
        provider: &AwsProvider,
        domain: &aws_sdk_ec2::types::TransitGatewayMulticastDomain,
    ) -> Result<Self> {
        let id = domain
            .transit_gateway_multicast_domain_id()
            .context(MissingFieldSnafu {
                operation: "DescribeTransitGatewayMulticastDomains",
                field: "TransitGatewayMulticastDomainId",
            })?;
        let options = domain.options();
        Ok(TransitGatewayMulticastDomainOutput {
            transit_gateway_multicast_domain_id: id.to_owned(),
            arn: domain.transit_gateway_multicast_domain_arn().map(str::to_owned),
            owner_id: domain.owner_id().map(str::to_owned),
            state: domain.state().map(|state| state.as_str().to_owned()),
            transit_gateway_id: domain.transit_gateway_id().map(str::to_owned),
            auto_accept_shared_associations: options
                .and_then(|o| o.auto_accept_shared_associations())
                .map(|v| v.as_str().to_owned()),
            igmpv2_support: options
                .and_then(|o| o.igmpv2_support())
                .map(|v| v.as_str().to_owned()),
            static_sources_support: options
                .and_then(|o| o.static_sources_support())
                .map(|v| v.as_str().to_owned()),
            tags: provider.observed_tags(Tags::from_ec2(domain.tags())),
            associations: vec![],
            members: vec![],
            sources: vec![],
        })
    }
}

/// Picks the one multicast domain out of a describe result.
///
/// A domain requested by id that has been deleted, or that isn't the one
/// returned, counts as not found.
fn single_multicast_domain(
    requested_id: Option<&str>,
    domains: Vec<aws_sdk_ec2::types::TransitGatewayMulticastDomain>,
) -> Result<aws_sdk_ec2::types::TransitGatewayMulticastDomain> {
    let domain = find::assert_single_value("DescribeTransitGatewayMulticastDomains", domains)?;
    if let Some(id) = requested_id {
        find::ensure_not_deleted(
            "EC2 transit gateway multicast domain",
            domain.state().map(|state| state.as_str()),
            GATEWAY_DELETED_STATES,
        )?;
        find::ensure_id_matches(
            "EC2 transit gateway multicast domain",
            id,
            domain.transit_gateway_multicast_domain_id(),
        )?;
    }
    Ok(domain)
}

impl TransitGatewayMulticastDomain {
    async fn associations(
        client: &aws_sdk_ec2::Client,
        id: &str,
    ) -> Result<Vec<MulticastDomainAssociation>> {
        let associations = find::collect_pages(move |token| {
            let request = client
                .get_transit_gateway_multicast_domain_associations()
                .transit_gateway_multicast_domain_id(id)
                .set_next_token(token);
            async move {
                let output = request.send().await.map_err(error::api(
                    "GetTransitGatewayMulticastDomainAssociations",
                ))?;
                Ok((
                    output.multicast_domain_associations().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        Ok(associations.iter().map(MulticastDomainAssociation::from_sdk).collect())
    }

    async fn groups(
        client: &aws_sdk_ec2::Client,
        id: &str,
        role: GroupRole,
    ) -> Result<Vec<MulticastGroup>> {
        let filters = role.filters();
        let groups = find::collect_pages(move |token| {
            let request = client
                .search_transit_gateway_multicast_groups()
                .transit_gateway_multicast_domain_id(id)
                .set_filters(Some(filters.clone()))
                .set_next_token(token);
            async move {
                let output = request
                    .send()
                    .await
                    .map_err(error::api("SearchTransitGatewayMulticastGroups"))?;
                Ok((
                    output.multicast_groups().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        Ok(groups.iter().map(MulticastGroup::from_sdk).collect())
    }
}

impl sky::Resource for TransitGatewayMulticastDomain {
    type Provider = AwsProvider;
    type Error = Error;
    type Output = TransitGatewayMulticastDomainOutput;

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output> {
        let client = &client(provider);
        let filters = find::custom_filters(&self.filters);
        let ids = self
            .transit_gateway_multicast_domain_id
            .clone()
            .map(|id| vec![id]);
        let domains = find::collect_pages(move |token| {
            let request = client
                .describe_transit_gateway_multicast_domains()
                .set_transit_gateway_multicast_domain_ids(ids.clone())
                .set_filters((!filters.is_empty()).then(|| filters.clone()))
                .set_next_token(token);
            async move {
                let output = request.send().await.map_err(error::api_or_missing(
                    "DescribeTransitGatewayMulticastDomains",
                    MULTICAST_DOMAIN_NOT_FOUND,
                ))?;
                Ok((
                    output.transit_gateway_multicast_domains().to_vec(),
                    output.next_token().map(str::to_owned),
                ))
            }
        })
        .await?;
        let domain = single_multicast_domain(
            self.transit_gateway_multicast_domain_id.as_deref(),
            domains,
        )?;
        let mut output = TransitGatewayMulticastDomainOutput::from_sdk(provider, &domain)?;
        let id = output.transit_gateway_multicast_domain_id.clone();
        log::debug!("found transit gateway multicast domain {id}");
        output.associations = Self::associations(client, &id).await?;
        output.members = Self::groups(client, &id, GroupRole::Member).await?;
        output.sources = Self::groups(client, &id, GroupRole::Source).await?;
        Ok(output)
    }

    async fn delete(&self, _provider: &Self::Provider, previous_remote: &Self::Output) -> Result<()> {
        log::debug!(
            "forgetting transit gateway multicast domain {}",
            previous_remote.transit_gateway_multicast_domain_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Resource;
    use pretty_assertions::assert_eq;

    fn gateway(id: &str, state: &str) -> aws_sdk_ec2::types::CustomerGateway {
        aws_sdk_ec2::types::CustomerGateway::builder()
            .customer_gateway_id(id)
            .state(state)
            .bgp_asn("65000")
            .ip_address("198.51.100.7")
            .build()
    }

    fn customer_gateway() -> CustomerGateway {
        CustomerGateway {
            bgp_asn: 65000,
            ip_address: Some("198.51.100.7".into()),
            certificate_arn: None,
            device_name: None,
            tags: Tags::new().with("site", "office"),
        }
    }

    fn filter_pairs(filters: &[Filter]) -> Vec<(String, Vec<String>)> {
        filters
            .iter()
            .map(|f| (f.name().unwrap_or_default().to_owned(), f.values().to_vec()))
            .collect()
    }

    #[test]
    fn asns_above_i32_use_the_extended_parameter() {
        assert_eq!((Some(65000), None), asn_params(65000));
        assert_eq!((None, Some(4_200_000_000)), asn_params(4_200_000_000));
    }

    #[test]
    fn deleted_or_mismatched_gateways_are_not_found() {
        let found = customer_gateway_by_id("cgw-1", vec![gateway("cgw-1", "available")]).unwrap();
        assert_eq!(Some("cgw-1"), found.customer_gateway_id());

        let deleted = customer_gateway_by_id("cgw-1", vec![gateway("cgw-1", "deleted")]).unwrap_err();
        assert!(deleted.is_not_found(), "{deleted}");

        let other = customer_gateway_by_id("cgw-1", vec![gateway("cgw-2", "available")]).unwrap_err();
        assert!(other.is_not_found(), "{other}");

        let none = customer_gateway_by_id("cgw-1", vec![]).unwrap_err();
        assert!(none.is_not_found(), "{none}");
    }

    #[test]
    fn customer_gateway_validation() {
        assert!(customer_gateway().validate().is_ok());

        let mut bad = customer_gateway();
        bad.bgp_asn = 0;
        assert!(bad.validate().is_err());

        let mut bad = customer_gateway();
        bad.ip_address = Some("not-an-ip".into());
        assert!(bad.validate().is_err());

        let mut bad = customer_gateway();
        bad.ip_address = None;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn only_tags_update_in_place() {
        let mut retagged = customer_gateway();
        retagged.tags = Tags::new();
        assert!(!retagged.requires_replacement(&customer_gateway()));

        let mut moved = customer_gateway();
        moved.ip_address = Some("198.51.100.8".into());
        assert!(moved.requires_replacement(&customer_gateway()));
    }

    #[test]
    fn customer_gateway_output_prefers_the_extended_asn() {
        let provider = AwsProvider::new(aws_config::SdkConfig::builder().build());
        let sdk = aws_sdk_ec2::types::CustomerGateway::builder()
            .customer_gateway_id("cgw-1")
            .bgp_asn("")
            .bgp_asn_extended("4200000000")
            .tags(aws_sdk_ec2::types::Tag::builder().key("site").value("office").build())
            .tags(aws_sdk_ec2::types::Tag::builder().key("aws:cloudformation:stack-id").value("x").build())
            .build();
        let output = CustomerGatewayOutput::from_sdk(&provider, &sdk).unwrap();
        assert_eq!("4200000000", output.bgp_asn);
        assert_eq!(Tags::new().with("site", "office"), output.tags_all);
    }

    #[test]
    fn vpn_attachment_filters() {
        let query = TransitGatewayVpnAttachment {
            transit_gateway_id: Some("tgw-1".into()),
            vpn_connection_id: Some("vpn-1".into()),
            tags: Tags::new().with("env", "prod"),
            filters: vec![CustomFilter::new("state", ["available"])],
        };
        assert_eq!(
            vec![
                ("resource-id".to_owned(), vec!["vpn-1".to_owned()]),
                ("resource-type".to_owned(), vec!["vpn".to_owned()]),
                ("transit-gateway-id".to_owned(), vec!["tgw-1".to_owned()]),
                ("state".to_owned(), vec!["available".to_owned()]),
                ("tag:env".to_owned(), vec!["prod".to_owned()]),
            ],
            filter_pairs(&query.filters())
        );

        let only_type = TransitGatewayVpnAttachment::default();
        assert_eq!(
            vec![("resource-type".to_owned(), vec!["vpn".to_owned()])],
            filter_pairs(&only_type.filters())
        );
    }

    fn multicast_domain(id: &str, state: &str) -> aws_sdk_ec2::types::TransitGatewayMulticastDomain {
        aws_sdk_ec2::types::TransitGatewayMulticastDomain::builder()
            .transit_gateway_multicast_domain_id(id)
            .transit_gateway_id("tgw-1")
            .state(aws_sdk_ec2::types::TransitGatewayMulticastDomainState::from(state))
            .options(
                aws_sdk_ec2::types::TransitGatewayMulticastDomainOptions::builder()
                    .igmpv2_support(aws_sdk_ec2::types::Igmpv2SupportValue::Enable)
                    .static_sources_support(aws_sdk_ec2::types::StaticSourcesSupportValue::Disable)
                    .build(),
            )
            .tags(aws_sdk_ec2::types::Tag::builder().key("Name").value("video").build())
            .build()
    }

    #[test]
    fn multicast_domain_lookup_semantics() {
        let found = single_multicast_domain(
            Some("tgw-mcast-domain-1"),
            vec![multicast_domain("tgw-mcast-domain-1", "available")],
        )
        .unwrap();
        assert_eq!(
            Some("tgw-mcast-domain-1"),
            found.transit_gateway_multicast_domain_id()
        );

        let deleted = single_multicast_domain(
            Some("tgw-mcast-domain-1"),
            vec![multicast_domain("tgw-mcast-domain-1", "deleted")],
        )
        .unwrap_err();
        assert!(deleted.is_not_found(), "{deleted}");

        let other = single_multicast_domain(
            Some("tgw-mcast-domain-1"),
            vec![multicast_domain("tgw-mcast-domain-2", "available")],
        )
        .unwrap_err();
        assert!(other.is_not_found(), "{other}");

        // Without an id, filters may match anything but must match one.
        let many = single_multicast_domain(
            None,
            vec![
                multicast_domain("tgw-mcast-domain-1", "available"),
                multicast_domain("tgw-mcast-domain-2", "available"),
            ],
        )
        .unwrap_err();
        assert!(!many.is_not_found(), "{many}");
        assert!(single_multicast_domain(None, vec![]).unwrap_err().is_not_found());
    }

    #[test]
    fn multicast_domain_output() {
        let provider = AwsProvider::new(aws_config::SdkConfig::builder().build());
        let output = TransitGatewayMulticastDomainOutput::from_sdk(
            &provider,
            &multicast_domain("tgw-mcast-domain-1", "available"),
        )
        .unwrap();
        assert_eq!("tgw-mcast-domain-1", output.transit_gateway_multicast_domain_id);
        assert_eq!(Some("available".to_owned()), output.state);
        assert_eq!(Some("enable".to_owned()), output.igmpv2_support);
        assert_eq!(Some("disable".to_owned()), output.static_sources_support);
        assert_eq!(None, output.auto_accept_shared_associations);
        assert_eq!(Tags::new().with("Name", "video"), output.tags);
        assert!(output.members.is_empty());

        let association = aws_sdk_ec2::types::TransitGatewayMulticastDomainAssociation::builder()
            .transit_gateway_attachment_id("tgw-attach-1")
            .subnet(
                aws_sdk_ec2::types::SubnetAssociation::builder()
                    .subnet_id("subnet-1")
                    .build(),
            )
            .build();
        assert_eq!(
            MulticastDomainAssociation {
                subnet_id: Some("subnet-1".into()),
                transit_gateway_attachment_id: Some("tgw-attach-1".into()),
            },
            MulticastDomainAssociation::from_sdk(&association)
        );

        let group = aws_sdk_ec2::types::TransitGatewayMulticastGroup::builder()
            .group_ip_address("224.0.0.1")
            .network_interface_id("eni-1")
            .group_member(true)
            .build();
        assert_eq!(
            MulticastGroup {
                group_ip_address: Some("224.0.0.1".into()),
                network_interface_id: Some("eni-1".into()),
            },
            MulticastGroup::from_sdk(&group)
        );
    }

    #[test]
    fn multicast_group_role_filters() {
        assert_eq!(
            vec![
                ("is-group-member".to_owned(), vec!["true".to_owned()]),
                ("is-group-source".to_owned(), vec!["false".to_owned()]),
            ],
            filter_pairs(&GroupRole::Member.filters())
        );
        assert_eq!(
            vec![
                ("is-group-member".to_owned(), vec!["false".to_owned()]),
                ("is-group-source".to_owned(), vec!["true".to_owned()]),
            ],
            filter_pairs(&GroupRole::Source.filters())
        );
    }

    #[tokio::test]
    async fn lookups_only_forget_on_delete() {
        let provider = AwsProvider::new(aws_config::SdkConfig::builder().build());
        let output = TransitGatewayConnectOutput {
            transit_gateway_connect_id: "tgw-attach-1".into(),
            transit_gateway_id: None,
            transport_attachment_id: None,
            protocol: Some("gre".into()),
            tags: Tags::new(),
        };
        assert!(TransitGatewayConnect::default()
            .delete(&provider, &output)
            .await
            .is_ok());
    }
}
