//! Azure adapter: public IPs on VM network interface IP configurations
//!
//! Binding resolves the public IP resource by address, finds the VM's primary
//! network interface, points the IP configuration holding the pod IP at the
//! public IP, and PUTs the whole interface back. Unbinding clears that
//! reference, but only while it still points at the workload's public IP, so
//! an address handed to another pod since is left alone. The resource group
//! holds the VMs, interfaces and public IPs.

use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::{ArmApi, ArmClient, ProviderError, ResourceManager};

const COMPUTE_API_VERSION: &str = "2023-03-01";
const NETWORK_API_VERSION: &str = "2023-05-01";

/// [`ResourceManager`] for Azure VMs
pub struct AzureResourceManager<A: ArmApi = ArmClient> {
    arm: A,
    subscription_id: String,
    resource_group: String,
}

impl<A: ArmApi> AzureResourceManager<A> {
    /// Create an adapter for VMs in `resource_group`
    pub fn new(
        arm: A,
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Self {
        Self {
            arm,
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
        }
    }

    fn group_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.subscription_id, self.resource_group
        )
    }

    /// Resource id of the public IP whose address is `address`
    async fn find_public_ip(&self, address: IpAddr) -> Result<String, ProviderError> {
        let wanted = address.to_string();
        let path = format!(
            "{}/providers/Microsoft.Network/publicIPAddresses",
            self.group_path()
        );
        let mut page = self.arm.get(&path, NETWORK_API_VERSION).await?;

        loop {
            let found = page["value"].as_array().and_then(|items| {
                items
                    .iter()
                    .find(|pip| pip["properties"]["ipAddress"].as_str() == Some(wanted.as_str()))
            });
            if let Some(pip) = found {
                return pip["id"]
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| ProviderError::Malformed("public IP without id".into()));
            }
            match page["nextLink"].as_str().map(String::from) {
                Some(link) => page = self.arm.get_link(&link).await?,
                None => return Err(ProviderError::PublicIpNotFound(address)),
            }
        }
    }

    /// Fetch the primary interface of VM `host`, returning its id and body
    async fn primary_nic(&self, host: &str) -> Result<(String, Value), ProviderError> {
        let vm_path = format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.group_path(),
            host
        );
        let vm = self.arm.get(&vm_path, COMPUTE_API_VERSION).await?;
        let nic_id =
            primary_nic_id(&vm).ok_or_else(|| ProviderError::NicNotFound(host.to_string()))?;
        let nic = self.arm.get(&nic_id, NETWORK_API_VERSION).await?;
        Ok((nic_id, nic))
    }
}

/// First interface flagged primary, or without a flag at all
pub(crate) fn primary_nic_id(vm: &Value) -> Option<String> {
    vm["properties"]["networkProfile"]["networkInterfaces"]
        .as_array()?
        .iter()
        .find(|nic| {
            nic["properties"]["primary"]
                .as_bool()
                .unwrap_or(true)
        })
        .and_then(|nic| nic["id"].as_str())
        .map(String::from)
}

fn ip_config_mut<'a>(nic: &'a mut Value, local_ip: IpAddr) -> Option<&'a mut Value> {
    let wanted = local_ip.to_string();
    nic["properties"]["ipConfigurations"]
        .as_array_mut()?
        .iter_mut()
        .find(|cfg| cfg["properties"]["privateIPAddress"].as_str() == Some(wanted.as_str()))
}

/// Point the IP configuration for `local_ip` at `public_ip_id`
///
/// Returns whether the interface changed.
pub(crate) fn attach_public_ip(
    nic_id: &str,
    nic: &mut Value,
    local_ip: IpAddr,
    public_ip_id: &str,
) -> Result<bool, ProviderError> {
    let cfg = ip_config_mut(nic, local_ip).ok_or_else(|| ProviderError::IpConfigNotFound {
        nic: nic_id.to_string(),
        local_ip,
    })?;

    let current = cfg["properties"]["publicIPAddress"]["id"].as_str();
    if current.is_some_and(|id| id.eq_ignore_ascii_case(public_ip_id)) {
        return Ok(false);
    }
    cfg["properties"]["publicIPAddress"] = json!({ "id": public_ip_id });
    Ok(true)
}

/// Clear the public IP reference of the IP configuration for `local_ip`
///
/// With `expected` set, the reference is cleared only if it names that public
/// IP; anything else attached there belongs to someone else. Returns whether
/// the interface changed.
pub(crate) fn detach_public_ip(
    nic_id: &str,
    nic: &mut Value,
    local_ip: IpAddr,
    expected: Option<&str>,
) -> Result<bool, ProviderError> {
    let cfg = ip_config_mut(nic, local_ip).ok_or_else(|| ProviderError::IpConfigNotFound {
        nic: nic_id.to_string(),
        local_ip,
    })?;

    let Some(current) = cfg["properties"]["publicIPAddress"]["id"].as_str() else {
        return Ok(false);
    };
    if expected.is_some_and(|id| !id.eq_ignore_ascii_case(current)) {
        debug!(%local_ip, attached = %current, "public IP attached is not ours");
        return Ok(false);
    }

    Ok(cfg["properties"]
        .as_object_mut()
        .and_then(|props| props.remove("publicIPAddress"))
        .is_some())
}

#[async_trait]
impl<A: ArmApi> ResourceManager for AzureResourceManager<A> {
    #[instrument(skip(self))]
    async fn bind(
        &self,
        host: &str,
        local_ip: IpAddr,
        external_ip: IpAddr,
    ) -> Result<(), ProviderError> {
        let public_ip_id = self.find_public_ip(external_ip).await?;
        let (nic_id, mut nic) = self.primary_nic(host).await?;

        if !attach_public_ip(&nic_id, &mut nic, local_ip, &public_ip_id)? {
            debug!(%local_ip, %external_ip, "public IP already attached");
            return Ok(());
        }

        self.arm.put(&nic_id, NETWORK_API_VERSION, &nic).await?;
        info!(%local_ip, %external_ip, nic = %nic_id, "bound public IP");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unbind(
        &self,
        host: &str,
        local_ip: IpAddr,
        external_ip: Option<IpAddr>,
    ) -> Result<(), ProviderError> {
        let public_ip_id = match external_ip {
            Some(address) => match self.find_public_ip(address).await {
                Ok(id) => Some(id),
                Err(ProviderError::PublicIpNotFound(_)) => {
                    debug!(%local_ip, %address, "public IP no longer exists");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let (nic_id, mut nic) = self.primary_nic(host).await?;

        if !detach_public_ip(&nic_id, &mut nic, local_ip, public_ip_id.as_deref())? {
            debug!(%local_ip, "public IP not attached");
            return Ok(());
        }

        self.arm.put(&nic_id, NETWORK_API_VERSION, &nic).await?;
        info!(%local_ip, external_ip = ?external_ip, nic = %nic_id, "unbound public IP");
        Ok(())
    }
}
