// Firmware update and reboot

//! Firmware flashing and device reboot
//!
//! Flashing is started in a detached worker and the admin UI polls for the
//! result. While `netflash` runs, `pidof` finds it; once it is gone, a result
//! file in the work directory tells a failure apart from success. Flashing
//! has no timeout.

use crate::bridge::BridgeConfig;
use crate::error::ValidationError;
use crate::exec::{self, BackgroundJob, NETFLASH, RM, SUDO, TOUCH, WGET};
use crate::flags::{FlagState, TransactionFlag};
use crate::form::Form;
use crate::network;
use crate::settings::{self, SystemSettings};
use crate::store::Store;
use crate::types::{FlashRegion, NetworkInterfaceConfig, Product};
use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use std::fs;

/// Result file content when the image is for another product
pub const WRONG_PRODUCT: &str = "wrong_product";

/// netflash exit status for an image built for another product
const NETFLASH_WRONG_PRODUCT: i32 = 10;

/// Reboot wait without bridge or first-boot extras
pub const STANDARD_REBOOT_SECS: u64 = 40;

/// Extra time on first boot for SSH host key generation
pub const FIRST_BOOT_EXTRA_SECS: u64 = 90;

const FIRMWARE_SUFFIX: &str = ".gz";

// Form element names
const FIELD_USERLAND_PATH: &str = "userland_path_h";
const FIELD_KERNEL_PATH: &str = "kernel_path_h";
const FIELD_ALLOW_OTHER_PRODUCTS: &str = "allow_other_products";
const FIELD_FIRMWARE_URL: &str = "firmware_url";

/// How a finished flash ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    /// Image written
    Success,
    /// Image rejected as built for another product
    WrongProduct,
    /// Any other netflash failure
    Failure,
}

impl FlashOutcome {
    /// Text shown to the user
    pub fn message(&self) -> &'static str {
        match self {
            FlashOutcome::Success => "Firmware updated",
            FlashOutcome::WrongProduct => "The firmware image is different from the current type",
            FlashOutcome::Failure => "An error occured when updating firmware",
        }
    }
}

/// Progress of a flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// netflash is still running
    Flashing,
    /// netflash has exited
    Completed(FlashOutcome),
}

/// Where flash progress is observed
pub trait FlashStatusSource: Send + Sync {
    /// Current status of the flash job
    fn check(&self) -> BoxFuture<'_, Result<JobStatus>>;
}

/// Status from the running `netflash` process and its result file
///
/// Reading a completed status consumes it: the result file is removed, or
/// on success the updated-firmware flag is raised.
pub struct NetflashStatus<'a> {
    store: &'a Store,
}

impl<'a> NetflashStatus<'a> {
    /// Status source reading through `store`
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }
}

impl FlashStatusSource for NetflashStatus<'_> {
    fn check(&self) -> BoxFuture<'_, Result<JobStatus>> {
        Box::pin(async move {
            let runner = self.store.runner();

            if exec::is_process_alive(runner, "netflash").await? {
                return Ok(JobStatus::Flashing);
            }

            let result_path = self.store.paths().netflash_result();
            if result_path.exists() {
                let content = fs::read_to_string(&result_path).unwrap_or_default();
                let outcome = if content == WRONG_PRODUCT {
                    FlashOutcome::WrongProduct
                } else {
                    FlashOutcome::Failure
                };
                log::error!("netflash failed: {:?}", outcome);

                let path = result_path.to_string_lossy().into_owned();
                exec::exec_logged(runner, &[RM, path.as_str()]).await;
                return Ok(JobStatus::Completed(outcome));
            }

            self.store
                .flags()
                .set_or_log(TransactionFlag::UpdatedFirmware);
            Ok(JobStatus::Completed(FlashOutcome::Success))
        })
    }
}

/// Current state of a flash started earlier
pub async fn poll_status(store: &Store) -> Result<JobStatus> {
    NetflashStatus::new(store)
        .check()
        .await
        .context("Failed to get netflash process state")
}

/// A validated request to write an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Partition to write
    pub region: FlashRegion,
    /// Image location
    pub url: String,
    /// Skip the product check for userland images
    pub allow_other_products: bool,
}

/// Read the image URL for `region` from the update form
pub fn parse_flash_form(form: &Form, region: FlashRegion) -> Result<FlashRequest, ValidationError> {
    let field = match region {
        FlashRegion::Userland => FIELD_USERLAND_PATH,
        FlashRegion::Kernel => FIELD_KERNEL_PATH,
    };

    if form.is_blank(field) {
        return Err(ValidationError::new(field, "Please select an image file"));
    }
    let url = form.text(field);
    if !settings::is_valid_url(&url) {
        return Err(ValidationError::new(field, "The entered URL was not valid"));
    }

    Ok(FlashRequest {
        region,
        url,
        allow_other_products: !form.is_blank(FIELD_ALLOW_OTHER_PRODUCTS),
    })
}

/// Hand the flash to a detached worker and return straight away
pub fn start_flash(store: &Store, request: &FlashRequest) -> Result<()> {
    log::info!("Flashing {} from {}", request.region.device(), request.url);
    store.spawn(BackgroundJob::Flash {
        region: request.region,
        url: request.url.clone(),
        allow_other_products: request.allow_other_products,
    })
}

/// Validate the update form and start flashing
pub fn update(store: &Store, form: &Form, region: FlashRegion) -> Result<FlashRequest> {
    let request = parse_flash_form(form, region)?;
    start_flash(store, &request)?;
    Ok(request)
}

/// netflash arguments; the product check is kept only for userland images
/// when other products are not allowed
pub fn netflash_argv(region: FlashRegion, url: &str, allow_other_products: bool) -> Vec<String> {
    let mut argv = vec![SUDO, NETFLASH, "-k", "-b"];
    if region != FlashRegion::Userland || allow_other_products {
        argv.push("-n");
    }
    argv.extend_from_slice(&["-r", region.device(), url]);
    argv.into_iter().map(str::to_string).collect()
}

/// Worker side of [`start_flash`]
pub async fn run_flash(
    store: &Store,
    region: FlashRegion,
    url: &str,
    allow_other_products: bool,
) -> Result<()> {
    let argv = netflash_argv(region, url, allow_other_products);
    let output = store
        .runner()
        .run(&argv)
        .await
        .context("Failed to run netflash")?;

    if output.success() {
        log::info!("netflash finished");
        return Ok(());
    }

    log::error!("netflash exited with status {}", output.code);
    let result_path = store.paths().netflash_result();

    if output.code == NETFLASH_WRONG_PRODUCT {
        fs::create_dir_all(&store.paths().work_dir).context("Failed to create work directory")?;
        fs::write(&result_path, WRONG_PRODUCT).context("Failed to write netflash result")?;
    } else {
        let path = result_path.to_string_lossy().into_owned();
        exec::exec_logged(store.runner(), &[SUDO, TOUCH, path.as_str()]).await;
    }
    Ok(())
}

/// Seconds until the admin UI should expect the device back
///
/// The bridge only matters on the Armadillo-230, and only when enabled.
pub fn required_reboot_secs(product: &Product, bridge: Option<&BridgeConfig>, first_boot: bool) -> u64 {
    let mut secs = STANDARD_REBOOT_SECS;

    match product {
        Product::Armadillo230 => {
            if let Some(bridge) = bridge.filter(|b| b.create_bridge) {
                secs = secs.saturating_add(bridge.settle_secs());
            }
        }
        Product::Other(name) => log::warn!("Unrecognized product name {}", name),
        _ => {}
    }

    if first_boot {
        secs += FIRST_BOOT_EXTRA_SECS;
    }
    secs
}

/// What the user is told when the device goes down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootNotice {
    /// Seconds until the device should answer again
    pub secs: u64,
    /// Addressing the device comes back with
    pub network: NetworkInterfaceConfig,
}

/// Reboot the device without waiting for it
pub async fn reboot(store: &Store) -> Result<RebootNotice> {
    let settings = store.settings()?;
    let paths = store.paths();

    let network = network::get_current(paths, &settings.primary_if)
        .context("Failed to get current network info")?;

    let first_boot =
        store.flags().state(TransactionFlag::SettingsInitialized) == Some(FlagState::NotYetChecked);

    let bridge = match settings.product() {
        Product::Armadillo230 => BridgeConfig::load(&paths.bridges)?,
        _ => None,
    };
    let secs = required_reboot_secs(&settings.product(), bridge.as_ref(), first_boot);

    store
        .spawn(BackgroundJob::Reboot)
        .context("Execution of reboot command failed")?;
    log::info!("Rebooting, back in about {}s", secs);

    Ok(RebootNotice { secs, network })
}

/// Firmware images offered at the download location
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// `(file name, full URL)`
    pub userland: Vec<(String, String)>,
    /// `(file name, full URL)`
    pub kernel: Vec<(String, String)>,
}

impl UpdateOptions {
    /// True when neither region has an image
    pub fn is_empty(&self) -> bool {
        self.userland.is_empty() && self.kernel.is_empty()
    }
}

/// Collect `.gz` links from a directory listing
///
/// A link may be offered as both userland and kernel when it matches both
/// lists.
pub fn parse_update_options(listing: &str, settings: &SystemSettings) -> UpdateOptions {
    const HREF: &str = "href=\"";

    let mut options = UpdateOptions::default();
    let lower = listing.to_ascii_lowercase();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(HREF) {
        let start = pos + found + HREF.len();
        let Some(len) = listing[start..].find('"') else {
            break;
        };
        let name = &listing[start..start + len];
        pos = start + len + 1;

        if !name.ends_with(FIRMWARE_SUFFIX) {
            continue;
        }
        let url = format!("{}{}", settings.firmware_url, name);

        if settings.userland_matches.iter().any(|m| name.contains(m.as_str())) {
            options.userland.push((name.to_string(), url.clone()));
        }
        if settings.kernel_matches.iter().any(|m| name.contains(m.as_str())) {
            options.kernel.push((name.to_string(), url));
        }
    }

    options
}

/// Fetch the download location's listing and collect the images on offer
pub async fn update_options(store: &Store) -> Result<UpdateOptions> {
    let settings = store.settings()?;
    let url = settings.firmware_url.as_str();
    let output = exec::exec_checked(store.runner(), &[WGET, "-O", "-", url])
        .await
        .context("Failed to get update options")?;
    Ok(parse_update_options(&output.stdout, &settings))
}

/// Validate and save a new download location
pub async fn change_url(store: &Store, form: &Form) -> Result<()> {
    let mut settings = store.settings()?;
    settings.set_firmware_url(form.get(FIELD_FIRMWARE_URL).unwrap_or_default())?;

    let paths = store.paths();
    settings
        .save(store.runner(), &paths.work_dir, &paths.settings)
        .await
        .context("Failed to dump at-admin info")?;

    store.flags().set_or_log(TransactionFlag::UnsavedSettings);
    log::info!("Firmware URL set to {}", settings.firmware_url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_validation;
    use crate::store::testing::{Fixture, SETTINGS};

    const LISTING: &str = r#"<html><body>
<a HREF="linux-a230-v1.04.bin.gz">linux</a>
<a href="romfs-a230-v1.64.img.gz">romfs</a>
<a href="romfs-a230-v1.64.img">uncompressed</a>
<a href="README">readme</a>
</body></html>"#;

    const INTERFACES: &str = "auto eth0\niface eth0 inet static\naddress 192.168.10.10\nnetmask 255.255.255.0\nbroadcast 192.168.10.255\ngateway 192.168.10.1\n\n";

    fn bridge(create: bool, stp: bool, forward: &str) -> BridgeConfig {
        BridgeConfig {
            create_bridge: create,
            stp_on: stp,
            forward_delay: forward.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_reboot_secs_standard() {
        assert_eq!(required_reboot_secs(&Product::Armadillo220, None, false), 40);
        assert_eq!(required_reboot_secs(&Product::Armadillo9, None, true), 130);
        // Bridge ignored on other models
        let b = bridge(true, false, "");
        assert_eq!(required_reboot_secs(&Product::Armadillo240, Some(&b), false), 40);
    }

    #[test]
    fn test_reboot_secs_a230_bridge() {
        let product = Product::Armadillo230;
        assert_eq!(required_reboot_secs(&product, None, false), 40);
        assert_eq!(
            required_reboot_secs(&product, Some(&bridge(false, true, "4")), false),
            40
        );
        assert_eq!(
            required_reboot_secs(&product, Some(&bridge(true, false, "4")), false),
            55
        );
        assert_eq!(
            required_reboot_secs(&product, Some(&bridge(true, true, "4")), false),
            48
        );
        let stp = bridge(true, true, "10");
        assert_eq!(required_reboot_secs(&product, Some(&stp), false), 60);
        assert_eq!(required_reboot_secs(&product, Some(&stp), true), 150);
        assert_eq!(
            required_reboot_secs(&product, Some(&bridge(true, true, "DEFAULT")), true),
            160
        );
    }

    #[test]
    fn test_netflash_argv() {
        let url = "http://example.com/romfs.img.gz";
        assert_eq!(
            netflash_argv(FlashRegion::Userland, url, false).join(" "),
            "/usr/bin/sudo /bin/netflash -k -b -r /dev/flash/userland http://example.com/romfs.img.gz"
        );
        assert_eq!(
            netflash_argv(FlashRegion::Userland, url, true).join(" "),
            "/usr/bin/sudo /bin/netflash -k -b -n -r /dev/flash/userland http://example.com/romfs.img.gz"
        );
        assert_eq!(
            netflash_argv(FlashRegion::Kernel, url, false).join(" "),
            "/usr/bin/sudo /bin/netflash -k -b -n -r /dev/flash/kernel http://example.com/romfs.img.gz"
        );
    }

    #[test]
    fn test_parse_flash_form() {
        let err = parse_flash_form(&Form::new(), FlashRegion::Kernel).unwrap_err();
        assert_eq!(err.message, "Please select an image file");

        let form = Form::new().with("userland_path_h", "romfs.img.gz");
        let err = parse_flash_form(&form, FlashRegion::Userland).unwrap_err();
        assert_eq!(err.message, "The entered URL was not valid");

        let form = Form::new()
            .with("userland_path_h", "http://example.com/romfs.img.gz\r\n")
            .with("allow_other_products", "on");
        let request = parse_flash_form(&form, FlashRegion::Userland).unwrap();
        assert_eq!(request.url, "http://example.com/romfs.img.gz");
        assert!(request.allow_other_products);
    }

    #[test]
    fn test_parse_update_options() {
        let settings = SystemSettings::parse(SETTINGS).unwrap();
        let options = parse_update_options(LISTING, &settings);

        assert_eq!(
            options.kernel,
            vec![(
                "linux-a230-v1.04.bin.gz".to_string(),
                "http://download.example.com/armadillo-230/linux-a230-v1.04.bin.gz".to_string()
            )]
        );
        assert_eq!(options.userland.len(), 1);
        assert_eq!(options.userland[0].0, "romfs-a230-v1.64.img.gz");

        assert!(parse_update_options("<p>nothing here</p>", &settings).is_empty());
    }

    #[tokio::test]
    async fn test_update_options_fetches_listing() {
        let fx = Fixture::new("firmware-options");
        fx.runner.respond(
            "wget -O - http://download.example.com/armadillo-230/",
            LISTING,
            0,
        );
        let options = update_options(&fx.store).await.unwrap();
        assert!(!options.is_empty());

        fx.runner.respond(
            "wget -O - http://download.example.com/armadillo-230/",
            "",
            4,
        );
        assert!(update_options(&fx.store).await.is_err());
    }

    #[tokio::test]
    async fn test_update_spawns_worker() {
        let fx = Fixture::new("firmware-start");
        let form = Form::new().with("kernel_path_h", "http://example.com/linux.bin.gz");

        update(&fx.store, &form, FlashRegion::Kernel).unwrap();
        assert_eq!(
            fx.background.jobs(),
            vec![BackgroundJob::Flash {
                region: FlashRegion::Kernel,
                url: "http://example.com/linux.bin.gz".to_string(),
                allow_other_products: false,
            }]
        );

        // Invalid form starts nothing
        let err = update(&fx.store, &Form::new(), FlashRegion::Kernel).unwrap_err();
        assert!(as_validation(&err).is_some());
        assert_eq!(fx.background.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_run_flash_wrong_product() {
        let fx = Fixture::new("firmware-wrong-product");
        let argv = netflash_argv(FlashRegion::Userland, "http://x/romfs.gz", false);
        fx.runner.respond(&argv.join(" "), "", NETFLASH_WRONG_PRODUCT);

        run_flash(&fx.store, FlashRegion::Userland, "http://x/romfs.gz", false)
            .await
            .unwrap();
        assert_eq!(fx.read(&fx.paths().netflash_result()), WRONG_PRODUCT);

        let status = poll_status(&fx.store).await.unwrap();
        assert_eq!(status, JobStatus::Completed(FlashOutcome::WrongProduct));
        assert!(!fx.paths().netflash_result().exists());
        assert!(!fx.store.flags().is_set(TransactionFlag::UpdatedFirmware));
    }

    #[tokio::test]
    async fn test_run_flash_other_failure_touches_result() {
        let fx = Fixture::new("firmware-failure");
        let argv = netflash_argv(FlashRegion::Kernel, "http://x/linux.gz", false);
        fx.runner.respond(&argv.join(" "), "", 1);
        std::fs::create_dir_all(&fx.paths().work_dir).unwrap();

        run_flash(&fx.store, FlashRegion::Kernel, "http://x/linux.gz", false)
            .await
            .unwrap();
        assert!(fx.paths().netflash_result().exists());

        let status = poll_status(&fx.store).await.unwrap();
        assert_eq!(status, JobStatus::Completed(FlashOutcome::Failure));
        assert_eq!(
            FlashOutcome::Failure.message(),
            "An error occured when updating firmware"
        );
    }

    #[tokio::test]
    async fn test_poll_while_flashing_then_success() {
        let fx = Fixture::new("firmware-poll");
        fx.runner.respond("/bin/pidof netflash", "812\n", 0);

        assert_eq!(poll_status(&fx.store).await.unwrap(), JobStatus::Flashing);
        assert!(!fx.store.flags().is_set(TransactionFlag::UpdatedFirmware));

        assert_eq!(
            poll_status(&fx.store).await.unwrap(),
            JobStatus::Completed(FlashOutcome::Success)
        );
        assert!(fx.store.flags().is_set(TransactionFlag::UpdatedFirmware));
    }

    #[tokio::test]
    async fn test_reboot_reports_wait() {
        let fx = Fixture::new("firmware-reboot");
        fx.write(&fx.paths().interfaces, INTERFACES);
        fx.store.flags().set(TransactionFlag::SettingsInitialized).unwrap();

        let notice = reboot(&fx.store).await.unwrap();
        assert_eq!(notice.secs, 130);
        assert_eq!(notice.network.address, "192.168.10.10");
        assert_eq!(fx.background.jobs(), vec![BackgroundJob::Reboot]);
    }

    #[tokio::test]
    async fn test_reboot_needs_network_info() {
        let fx = Fixture::new("firmware-reboot-no-net");
        assert!(reboot(&fx.store).await.is_err());
        assert!(fx.background.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_change_url() {
        let fx = Fixture::new("firmware-url");

        let err = change_url(&fx.store, &Form::new().with("firmware_url", "mirror"))
            .await
            .unwrap_err();
        assert_eq!(as_validation(&err).unwrap().message, "The URL is not valid");

        change_url(&fx.store, &Form::new().with("firmware_url", "ftp://mirror.local/fw"))
            .await
            .unwrap();
        assert_eq!(
            fx.store.settings().unwrap().firmware_url,
            "ftp://mirror.local/fw/"
        );
        assert!(fx.store.flags().is_set(TransactionFlag::UnsavedSettings));
    }
}
