//! Check catalog: the fixed, ordered battery of compliance checks.
//!
//! Each entry names one self-contained check executable and the rule it
//! evaluates. Declaration order is the run order and the report order.
//! The built-in list can be replaced by `[[checks]]` tables in
//! `.checkrun/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::HarnessSettings;

/// Identity of one check: what to run and what it verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Stable identifier (the check's file name for built-in checks).
    pub id: String,
    /// Human-readable rule description, used as the report section title.
    pub description: String,
    /// Program to execute.
    pub program: String,
    /// Arguments passed to `program`. The check itself receives none.
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub work_dir: PathBuf,
    /// Script file the check runs, when it is interpreter-hosted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
}

impl CheckSpec {
    /// Whether the check's executable is present on disk.
    pub fn is_available(&self) -> bool {
        self.script.as_ref().is_none_or(|path| path.is_file())
    }
}

/// A `[[checks]]` entry from the config file.
///
/// ```toml
/// [[checks]]
/// id = "4.1 Securetransfer.py"
/// description = "4.1 Ensure that 'Secure transfer required' is set to 'Enabled'"
///
/// [[checks]]
/// id = "custom-audit"
/// program = "/opt/audit/bin/custom-audit"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CheckEntry {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Script path relative to the check directory (defaults to `id`).
    #[serde(default)]
    pub path: Option<String>,
    /// Run this program directly instead of the configured interpreter.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Catalog split into checks that can run and checks whose script is missing.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Every declared check, in run order.
    pub declared: Vec<CheckSpec>,
    pub runnable: Vec<CheckSpec>,
    pub missing: Vec<CheckSpec>,
}

/// Build the ordered catalog.
///
/// `entries` replaces the built-in battery when non-empty. Relative check
/// directories resolve against `base`.
pub fn resolve(settings: &HarnessSettings, entries: &[CheckEntry], base: &Path) -> Resolution {
    let check_dir = base.join(&settings.check_dir);

    let specs: Vec<CheckSpec> = if entries.is_empty() {
        BUILTIN_CHECKS
            .iter()
            .map(|(id, description)| interpreted(settings, &check_dir, id, description, id))
            .collect()
    } else {
        entries
            .iter()
            .map(|entry| from_entry(settings, &check_dir, entry))
            .collect()
    };

    let (runnable, missing) = specs.iter().cloned().partition(CheckSpec::is_available);
    Resolution {
        declared: specs,
        runnable,
        missing,
    }
}

fn interpreted(
    settings: &HarnessSettings,
    check_dir: &Path,
    id: &str,
    description: &str,
    path: &str,
) -> CheckSpec {
    let script = check_dir.join(path);
    CheckSpec {
        id: id.to_string(),
        description: description.to_string(),
        program: settings.interpreter.clone(),
        args: vec![script.display().to_string()],
        work_dir: check_dir.to_path_buf(),
        script: Some(script),
    }
}

fn from_entry(settings: &HarnessSettings, check_dir: &Path, entry: &CheckEntry) -> CheckSpec {
    let description = entry
        .description
        .clone()
        .or_else(|| builtin_description(&entry.id).map(str::to_string))
        .unwrap_or_else(|| format!("Running check: {}", entry.id));

    match &entry.program {
        Some(program) => CheckSpec {
            id: entry.id.clone(),
            description,
            program: program.clone(),
            args: entry.args.clone(),
            work_dir: check_dir.to_path_buf(),
            script: None,
        },
        None => {
            let path = entry.path.as_deref().unwrap_or(&entry.id);
            interpreted(settings, check_dir, &entry.id, &description, path)
        }
    }
}

/// Look up the description of a built-in check.
pub fn builtin_description(id: &str) -> Option<&'static str> {
    BUILTIN_CHECKS
        .iter()
        .find(|(check, _)| *check == id)
        .map(|(_, description)| *description)
}

/// Built-in battery, in run order: `(script file, rule description)`.
pub const BUILTIN_CHECKS: &[(&str, &str)] = &[
    ("2.1.3 mfaforall.py", "2.1.3 Ensure that 'Multi-Factor Auth Status' is 'Enabled' for all Non-Privileged Users"),
    ("2.1.4 remembermfa.py", "2.1.4 Ensure that 'Allow users to remember multi-factor authentication on devices they trust' is Disabled"),
    ("2.2.1 trusted locations.py", "2.2.1 Ensure Trusted Locations Are Defined"),
    ("2.2.2-2.2.8 ConditionalAccessPolicies.py", "2.2.2-2.2.8 review CA policies"),
    ("2.3 Tenant Creation.py", "2.3 Ensure that 'Restrict non-admin users from creating tenants' is set to 'Yes'"),
    ("2.4 GuestUsers.py", "2.4 Ensure Guest Users Are Reviewed on a Regular Basis"),
    ("2.5 numberofmethodstoreset.py", "2.5 Ensure That 'Number of methods required to reset' is set to '2'"),
    ("2.6 accountlockoutthreshold.py", "2.6 Ensure that account 'Lockout Threshold' is less than or equal to '10'"),
    ("2.7 accountlockoutduration.py", "2.7 Ensure that account 'Lockout duration in seconds' is greater than or equal to '60'"),
    ("2.8 bannedpasswordlist.py", "2.8 Ensure that a Custom Bad Password List is set to 'Enforce' for your Organization"),
    ("2.9 reconfirmauth.py", "2.9 Ensure that 'Number of days before users are asked to re-confirm their authentication information' is not set to '0'"),
    ("2.10 userpassresetnotification.py", "2.10 Ensure that 'Notify users on password resets?' is set to 'Yes'"),
    ("2.11 adminpasswordreset.py", "2.11 Ensure That 'Notify all admins when other admins reset their password?' is set to 'Yes'"),
    ("2.12 userappconsent.py", "2.12 Ensure User consent for applications is set to Do not allow user consent"),
    ("2.13 userappconsent.py", "2.13 Ensure 'User consent for applications' Is Set To 'Allow for Verified Publishers'"),
    ("2.14 userappregistration.py", "2.14 Ensure That 'Users Can Register Applications' Is Set to 'No'"),
    ("2.15 guestaccessrestrictions.py", "2.15 Ensure That 'Guest users access restrictions' is set to 'Guest user access is restricted to properties and memberships of their own directory objects'"),
    ("2.16 guestinvites.py", "2.16 Ensure that 'Guest invite restrictions' is set to 'Only users assigned to specific admin roles can invite guest users'"),
    ("2.17 entraadmincenteraccess.py", "2.17 Ensure That 'Restrict access to Microsoft Entra admin center' is Set to 'Yes'"),
    ("2.18 groupfeatureaccess.py", "2.18 Ensure that 'Restrict user ability to access groups features in the Access Pane' is Set to 'Yes'"),
    ("2.19 securitygroupcreation.py", "2.19 Ensure that 'Users can create security groups in Azure portals, API or PowerShell' is set to 'No'"),
    ("2.20 grouprequestmanagement.py", "2.20 Ensure that 'Owners can manage group membership requests in My Groups' is set to 'No'"),
    ("2.21 groupscreation.py", "2.21 Ensure that 'Users can create Microsoft 365 groups in Azure portals, API or PowerShell' is set to 'No'"),
    ("2.22 mfarequiredtojoin.py", "2.22 Ensure that 'Require Multifactor Authentication to register or join devices with Microsoft Entra' is set to 'Yes'"),
    ("2.23 customsubscriptionadmin.py", "2.23 Ensure That No Custom Subscription Administrator Roles Exist"),
    ("2.25 subingressandegress.py", "2.25 Ensure That 'Subscription leaving Microsoft Entra tenant' and 'Subscription entering Microsoft Entra tenant' Is Set To 'Permit no one'"),
    ("2.26 globaladmincount.py", "2.26 Ensure fewer than 5 users have global administrator assignment"),
    ("3.1.1.1 autoprovisioning.py", "3.1.1.1 Ensure that Auto provisioning of 'Log Analytics agent for Azure VMs' is Set to 'On'"),
    ("3.1.1.2 defendercloudappsint.py", "3.1.1.2 Ensure that Microsoft Defender for Cloud Apps integration with Microsoft Defender for Cloud is Selected"),
    ("3.1.1.2+defenderforservices.py", "3.1.3.1 Ensure That Microsoft Defender for Services Is Set to 'On'"),
    ("3.1.3.2 machinevulnasessment.py", "3.1.3.2 Ensure that 'Vulnerability assessment for machines' component status is set to 'On'"),
    ("3.1.11 cloudsecbenchmark.py", "3.1.11 Ensure that Microsoft Cloud Security Benchmark policies are not set to 'Disabled'"),
    ("3.1.12 userwithfollowingrolesareowner.py", "3.1.12 Ensure That 'All users with the following roles' is set to 'Owner'"),
    ("3.1.13 additionalemail.py", "3.1.13 Ensure 'Additional email addresses' is Configured with a Security Contact Email"),
    ("3.1.14 alertseverity.py", "3.1.14 Ensure That 'Notify about alerts with the following severity' is Set to 'High'"),
    ("3.3.1 keyvaultRBAC.py", "3.3.1 Ensure that the Expiration Date is set for all Keys in RBAC Key Vaults"),
    ("3.3.5 enablepurgeprotectionkeyvault.py", "3.3.5 Ensure the Key Vault is Recoverable"),
    ("3.3.7 keyvaultprivateendpoints.py", "3.3.7 Ensure that Private Endpoints are Used for Azure Key Vault"),
    ("3.3.8 keyvaultkeyroation.py", "3.3.8 Ensure Automatic Key Rotation is Enabled Within Azure Key Vault for the Supported Services"),
    ("4.1 Securetransfer.py", "4.1 Ensure that 'Secure transfer required' is set to 'Enabled'"),
    ("4.2 infrastructureencryption.py", "4.2 Ensure that 'Enable Infrastructure Encryption' for Each Storage Account in Azure Storage is Set to 'enabled'"),
    ("4.4 storagekeyrotation.py", "4.4 Ensure that Storage Account Access Keys are Periodically Regenerated"),
    ("4.5 sharedaccesssignature.py", "4.5 Ensure that Shared Access Signature Tokens Expire Within an Hour"),
    ("4.6 publicstorageaccess.py", "4.6 Ensure that 'Public Network Access' is 'Disabled' for storage accounts"),
    ("4.7 defaultnetworkaccess.py", "4.7 Ensure Default Network Access Rule for Storage Accounts is Set to Deny"),
    ("4.8 trustedazureservices.py", "4.8 Ensure 'Allow Azure services on the trusted services list to access this storage account' is Enabled for Storage Account Access"),
    ("4.9 privateendpoints.py", "4.9 Ensure Private Endpoints are used to access Storage Accounts"),
    ("4.10 softdelete.py", "4.10 Ensure Soft Delete is Enabled for Azure Containers and Blob Storage"),
    ("4.11 critstoragecmk.py", "4.11 Ensure Storage for Critical Data are Encrypted with Customer Managed Keys (CMK)"),
    ("4.12-14 storagelogging.py", "4.12 Ensure Storage Logging is Enabled for Queue, Blob, and Table Service for 'Read', 'Write', and 'Delete' requests"),
    ("4.15 tlsversion.py", "4.15 Ensure the 'Minimum TLS version' for storage accounts is set to 'Version 1.2'"),
    ("4.16 crosstenantreplication.py", "4.16 Ensure 'Cross Tenant Replication' is not enabled"),
    ("4.17 anonymousblobaccess.py", "4.17 Ensure that 'Allow Blob Anonymous Access' is set to 'Disabled'"),
    ("5.1.1 sqlauditing.py", "5.1.1 Ensure that 'Auditing' is set to 'On'"),
    ("5.1.2 sqlpublicingress.py", "5.1.2 Ensure no Azure SQL Databases allow ingress from 0.0.0.0/0 (ANY IP)"),
    ("5.1.3 sqltdecmk.py", "5.1.3 Ensure SQL server's Transparent Data Encryption (TDE) protector is encrypted with Customer-managed key"),
    ("5.2.1 securetransportpostgressql.py", "5.2.1 Ensure server parameter 'require_secure_transport' is set to 'ON' for PostgreSQL flexible server"),
    ("5.2.2 logcheckpointsforpostgressql.py", "5.2.2 Ensure server parameter 'log_checkpoints' is set to 'ON' for PostgreSQL flexible server"),
    ("5.2.3 connectionthrottlepostgresql.py", "5.2.3 Ensure server parameter 'connection_throttle.enable' is set to 'ON' for PostgreSQL flexible server"),
    ("5.2.4 logfileretention.py", "5.2.4 Ensure server parameter 'logfiles.retention_days' is greater than 3 days for PostgreSQL flexible server"),
    ("5.2.5 publicaccessTOpostgressql.py", "5.2.5 Ensure 'Allow public access from any Azure service within Azure to this server' for PostgreSQL flexible server is disabled"),
    ("5.2.6 postgreslogconnections.py", "5.2.6 [LEGACY] Ensure server parameter 'log_connections' is set to 'ON' for PostgreSQL single server"),
    ("5.2.7 logdisconnections.py", "5.2.7 [LEGACY] Ensure server parameter 'log_disconnections' is set to 'ON' for PostgreSQL single server"),
    ("5.3.1 mysqlflexsecuretransport.py", "5.3.1 Ensure server parameter 'require_secure_transport' is set to 'ON' for MySQL flexible server"),
    ("5.3.2 sqltlsversion.py", "5.3.2 Ensure server parameter 'tls_version' is set to 'TLSv1.2' (or higher) for MySQL flexible server"),
    ("5.3.3 mysqlauditlogenabled.py", "5.3.3 Ensure server parameter 'audit_log_enabled' is set to 'ON' for MySQL flexible server"),
    ("5.3.4 mysqlauditlogevents.py", "5.3.4 Ensure server parameter 'audit_log_events' has 'CONNECTION' set for MySQL flexible server"),
    ("5.4.1 firewallandnetworksaccess.py", "5.4.1 Ensure That 'Firewalls & Networks' Is Limited to Use Selected Networks Instead of All Networks"),
    ("6.1.1 diagnostic settings.py", "6.1.1 Ensure that a 'Diagnostic Setting' exists for Subscription Activity Logs"),
    ("6.1.2 diagsettings categories.py", "6.1.2 Ensure Diagnostic Setting captures appropriate categories"),
    ("6.1.3 log container cmk.py", "6.1.3 Ensure the storage account containing the container with activity logs is encrypted with Customer Managed Key (CMK)"),
    ("6.1.4 keyvaultlogging.py", "6.1.4 Ensure that logging for Azure Key Vault is 'Enabled'"),
    ("6.2.1 activitylogalerts.py", "6.2.1 Ensure that Activity Log Alert exists for Create Policy Assignment"),
    ("6.3.1 applicationinsights.py", "6.3.1 Ensure Application Insights are Configured"),
    ("6.4 resource logging.py", "6.4 Ensure that Azure Monitor Resource Logging is Enabled for All Services that Support it"),
    ("6.5 skubasicconsume.py", "6.5 Ensure that SKU Basic/Consumption is not used on artifacts that need to be monitored"),
    ("7.1 rdp access.py", "7.1 Ensure that RDP access from the Internet is evaluated and restricted"),
    ("7.2 ssh access.py", "7.2 Ensure that SSH access from the Internet is evaluated and restricted"),
    ("7.4 https.py", "7.4 Ensure that HTTP(S) access from the Internet is evaluated and restricted"),
    ("7.5 nsgretention.py", "7.5 Ensure that Network Security Group Flow Log retention period is 'greater than 90 days'"),
    ("7.6 network watcher.py", "7.6 Ensure that Network Watcher is 'Enabled' for Azure Regions that are in use"),
    ("7.7 publicips.py", "7.7 Ensure that Public IP addresses are Evaluated on a Periodic Basis"),
    ("8.1 bastion.py", "8.1 Ensure an Azure Bastion Host Exists"),
    ("8.2 manageddisks.py", "8.2 Ensure Virtual Machines are utilizing Managed Disks"),
    ("8.4 unattacheddiskcmk.py", "8.4 Ensure that 'Unattached disks' are encrypted with 'Customer Managed Key' (CMK)"),
    ("8.5 disknetworkaccess.py", "8.5 Ensure that 'Disk Network Access' is NOT set to 'Enable public access from all networks'"),
    ("8.6 dataaccessauth.py", "8.6 Ensure that 'Enable Data Access Authentication Mode' is 'Checked'"),
    ("8.7 approvedextensions.py", "8.7 Ensure that Only Approved Extensions Are Installed"),
    ("8.8 endpointprotection.py", "8.8 Ensure that Endpoint Protection for all Virtual Machines is installed"),
    ("8.11 trustedlaunch.py", "8.11 Ensure Trusted Launch is enabled on Virtual Machines"),
    ("9.1 httpsonly.py", "9.1 Ensure 'HTTPS Only' is set to On"),
    ("9.2 appserviceauth.py", "9.2 Ensure App Service Authentication is set up for apps in Azure App Service"),
    ("9.3 ftpsstate.py", "9.3 Ensure 'FTP State' is set to 'FTPS Only' or 'Disabled'"),
    ("9.4 webapptls.py", "9.4 Ensure Web App is using the latest version of TLS encryption"),
    ("9.5 registerwithentraid.py", "9.5 Ensure that Register with Entra ID is enabled on App Service"),
    ("9.6 webappbasicauth.py", "9.6 Ensure that 'Basic Authentication' is 'Disabled'"),
    ("9.7 phpversion.py", "9.7 Ensure that 'PHP version' is currently supported (if in use)"),
    ("9.8 pythonversion.py", "9.8 Ensure that 'Python version' is currently supported (if in use)"),
    ("9.9 javaversion.py", "9.9 Ensure that 'Java version' is currently supported (if in use)"),
    ("9.10 https20.py", "9.10 Ensure that 'HTTP20enabled' is set to 'true' (if in use)"),
    ("9.12 remotedebugging.py", "9.12 Ensure that 'Remote debugging' is set to 'Off'"),
];
