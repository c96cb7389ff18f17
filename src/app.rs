use crate::actions::{QuickActionRunner, ToastQueue};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::host::{BridgeOffer, BridgeViews, HostCommand, HostEvent, HostOutput, PendingChoices};
use crate::install::{InstallCoordinator, InstallEvent, InstallOutcome};
use crate::notify::NotificationRouter;
use crate::reachability::{Banner, ReachabilityEvent, ReachabilityMonitor};
use crate::sync::SyncScheduler;
use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The components driven by the event loop, constructed by the caller with
/// their collaborators already injected.
pub struct Components {
  pub reachability: ReachabilityMonitor,
  pub cache: CacheManager,
  pub scheduler: SyncScheduler,
  pub notifications: NotificationRouter,
  pub install: InstallCoordinator,
  pub actions: QuickActionRunner,
  pub views: BridgeViews,
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  reachability: ReachabilityMonitor,
  cache: CacheManager,
  scheduler: SyncScheduler,
  notifications: NotificationRouter,
  install: InstallCoordinator,
  actions: QuickActionRunner,

  /// Views the host last reported
  views: BridgeViews,

  /// Install prompts waiting on a host answer
  choices: PendingChoices,

  /// Toasts currently on screen
  toasts: Arc<Mutex<ToastQueue>>,

  /// Last banner sent to the host
  banner: Option<Banner>,

  /// Host command stream
  out: HostOutput,

  /// Work spawned in reaction to events
  tasks: JoinSet<()>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(config: Config, components: Components, out: HostOutput) -> Self {
    let toasts = ToastQueue::new(config.toast.duration());

    Self {
      config,
      reachability: components.reachability,
      cache: components.cache,
      scheduler: components.scheduler,
      notifications: components.notifications,
      install: components.install,
      actions: components.actions,
      views: components.views,
      choices: PendingChoices::default(),
      toasts: Arc::new(Mutex::new(toasts)),
      banner: None,
      out,
      tasks: JoinSet::new(),
      should_quit: false,
    }
  }

  /// Run until the host closes its input and spawned work has finished.
  pub async fn run(&mut self, mut events: EventHandler) -> Result<()> {
    let mut reachability = self.reachability.subscribe();
    let mut install = self.install.subscribe();

    self.reachability.start();
    self.refresh_banner();
    self.scheduler.register_defaults(&self.config.sync);
    info!(
      registered = self.scheduler.tasks().len(),
      periodic = self.scheduler.is_available(),
      "Background sync ready"
    );
    self.preload();

    loop {
      // Component transitions go first so they are seen before the next
      // host event
      tokio::select! {
        biased;
        Some(event) = reachability.recv() => self.handle_reachability(event),
        Some(event) = install.recv() => self.handle_install(event),
        Some(event) = events.next() => self.handle_event(event),
        Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
          if let Err(e) = joined {
            warn!("Background task failed: {}", e);
          }
        }
        else => break,
      }

      if self.should_quit && self.tasks.is_empty() {
        break;
      }
    }

    self.reachability.unsubscribe(reachability.id());
    self.install.unsubscribe(install.id());
    info!("Host closed, shutting down");
    Ok(())
  }

  fn preload(&mut self) {
    let cache = self.cache.clone();
    let urls = self.config.cache.preload.clone();
    let out = self.out.clone();

    self.tasks.spawn(async move {
      let report = cache.preload(&urls).await;
      out.send(HostCommand::PreloadComplete(report));
    });
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Host(host_event) => self.handle_host_event(host_event),
      Event::Tick => self.handle_tick(),
      Event::Wake(name) => self.run_sync(name),
      Event::HostClosed => {
        self.should_quit = true;
        // Nobody is left to answer an install prompt
        let abandoned = self.choices.abandon_all();
        if abandoned > 0 {
          debug!(abandoned, "Abandoned pending install prompts");
        }
      }
    }
  }

  fn handle_host_event(&mut self, event: HostEvent) {
    debug!(?event, "Host event");
    match event {
      HostEvent::Online => self.reachability.report(true),
      HostEvent::Offline => self.reachability.report(false),
      HostEvent::ResourceVisible(resource) => {
        let outcome = self.cache.observe(&resource);
        debug!(url = %resource.url, ?outcome, "Resource observed");
      }
      HostEvent::Views { views } => self.views.update(views),
      HostEvent::PeriodicSync { tag } => self.run_sync(tag),
      HostEvent::Push { payload } => self.show_notification(payload.as_deref()),
      HostEvent::NotificationClick { id, action, data } => {
        let router = self.notifications.clone();
        let out = self.out.clone();
        self.tasks.spawn(async move {
          match router.handle_interaction(id, action.as_deref(), &data).await {
            Ok(navigation) => out.send(HostCommand::Navigated(navigation)),
            Err(e) => warn!("Notification click not routed: {}", e),
          }
        });
      }
      HostEvent::NotificationClose { id } => {
        self.notifications.dismiss(id);
      }
      HostEvent::BeforeInstallPrompt { id } => {
        if !self.config.capabilities.install_prompt {
          debug!(offer = %id, "Install prompt unavailable, ignoring offer");
          return;
        }
        let offer = BridgeOffer::new(id, self.out.clone(), self.choices.clone());
        self.install.capture_offer(Box::new(offer));
      }
      HostEvent::InstallPromptRequest => {
        if !self.config.capabilities.install_prompt {
          self.out.send(HostCommand::InstallResult {
            outcome: InstallOutcome::Unavailable,
          });
          return;
        }
        let install = self.install.clone();
        let out = self.out.clone();
        self.tasks.spawn(async move {
          let outcome = install.prompt_user().await;
          out.send(HostCommand::InstallResult { outcome });
        });
      }
      HostEvent::InstallChoice { id, choice } => {
        self.choices.resolve(&id, choice);
      }
      HostEvent::AppInstalled => self.install.on_installed(),
      HostEvent::QuickAction(action) => {
        let runner = self.actions.clone();
        let toasts = Arc::clone(&self.toasts);
        let out = self.out.clone();
        self.tasks.spawn(async move {
          let result = runner.run(&action).await;
          let toast = match toasts.lock() {
            Ok(mut toasts) => toasts.push(result.kind, result.message),
            Err(e) => {
              warn!("Toast queue poisoned: {}", e);
              return;
            }
          };
          out.send(HostCommand::ShowToast(toast));
          if let Some(effect) = result.effect {
            out.send(effect.into());
          }
        });
      }
      HostEvent::CacheQuery { url } => {
        let state = self.cache.state(&url);
        self.out.send(HostCommand::CacheState { url, state });
      }
      HostEvent::Evict { namespace } => match self.cache.evict(&namespace) {
        Ok(existed) => self.out.send(HostCommand::Evicted { namespace, existed }),
        Err(e) => warn!("Failed to evict {}: {}", namespace, e),
      },
      HostEvent::Stats => self.out.send(HostCommand::Stats(self.cache.stats())),
    }
  }

  fn show_notification(&mut self, payload: Option<&str>) {
    if !self.config.capabilities.notifications {
      debug!("Notifications unavailable, dropping push");
      return;
    }

    let display = self.notifications.display(payload);
    if let Some(replaced) = display.replaced {
      self.out.send(HostCommand::CloseNotification { id: replaced });
    }
    self.out.send(HostCommand::ShowNotification(display.request));
  }

  fn handle_tick(&mut self) {
    self.refresh_banner();

    let expired = match self.toasts.lock() {
      Ok(mut toasts) => toasts.expire(),
      Err(_) => Vec::new(),
    };
    for id in expired {
      self.out.send(HostCommand::DismissToast { id });
    }
  }

  fn handle_reachability(&mut self, event: ReachabilityEvent) {
    self.refresh_banner();

    if event != ReachabilityEvent::WentOnline {
      return;
    }

    let cache = self.cache.clone();
    let scheduler = self.scheduler.clone();
    let out = self.out.clone();
    self.tasks.spawn(async move {
      let (report, syncs) = tokio::join!(cache.reconcile(), scheduler.run_all());
      info!(
        stored = report.stored,
        failed = report.failed,
        "Reconciled after reconnect"
      );
      for sync in syncs {
        out.send(HostCommand::SyncResult(sync));
      }
    });
  }

  fn handle_install(&mut self, event: InstallEvent) {
    match event {
      InstallEvent::OfferAvailable => {
        self.out.send(HostCommand::InstallAvailable { available: true });
      }
      InstallEvent::OfferCleared => {
        self.out.send(HostCommand::InstallAvailable { available: false });
      }
      InstallEvent::Installed => debug!("Install recorded"),
    }
  }

  fn run_sync(&mut self, name: String) {
    let scheduler = self.scheduler.clone();
    let out = self.out.clone();
    self.tasks.spawn(async move {
      let report = scheduler.on_wake(&name).await;
      out.send(HostCommand::SyncResult(report));
    });
  }

  /// Tell the host about banner changes, including the reconnect notice
  /// expiring on its own
  fn refresh_banner(&mut self) {
    let banner = self.reachability.banner();
    if self.banner != Some(banner) {
      self.banner = Some(banner);
      self.out.send(HostCommand::Banner { banner });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::actions::{ProductSummary, QuickActions, Toast, ToastKind};
  use crate::cache::{FetchedResponse, Fetcher, NamespaceResolver, SqliteStore};
  use crate::host::Capabilities;
  use crate::sync::{SyncHandler, SyncReport, SyncStatus};
  use color_eyre::eyre::eyre;
  use futures::future::{BoxFuture, FutureExt};
  use std::collections::{BTreeMap, HashMap};
  use std::time::Duration;
  use tokio::io::BufReader;
  use tokio::sync::mpsc;

  const ORIGIN: &str = "https://shop.example.com";

  struct OkFetcher;

  impl Fetcher for OkFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchedResponse>> {
      let body = url.as_bytes().to_vec();
      async move {
        Ok(FetchedResponse {
          status: 200,
          headers: BTreeMap::new(),
          body,
        })
      }
      .boxed()
    }
  }

  struct OfflineStore;

  impl QuickActions for OfflineStore {
    fn add_to_cart(&self, _product_id: &str, _quantity: u32) -> BoxFuture<'_, Result<()>> {
      async { Err(eyre!("network down")) }.boxed()
    }

    fn add_to_wishlist(&self, _product_id: &str) -> BoxFuture<'_, Result<()>> {
      async { Err(eyre!("network down")) }.boxed()
    }

    fn get_product(&self, _product_id: &str) -> BoxFuture<'_, Result<ProductSummary>> {
      async { Err(eyre!("network down")) }.boxed()
    }
  }

  struct NoopSync;

  impl SyncHandler for NoopSync {
    fn run(&self) -> BoxFuture<'static, Result<()>> {
      async { Ok(()) }.boxed()
    }
  }

  fn app(out: HostOutput) -> App {
    app_with(out, Capabilities::default())
  }

  fn app_with(out: HostOutput, capabilities: Capabilities) -> App {
    let mut config = Config::default();
    config.capabilities = capabilities;
    config.origin = ORIGIN.to_string();
    config.cache.preload = vec!["/icons/icon-192x192.png".to_string()];

    let resolver = NamespaceResolver::new(ORIGIN, &config.cache).unwrap();
    let cache = CacheManager::new(
      Arc::new(SqliteStore::in_memory().unwrap()),
      Arc::new(OkFetcher),
      resolver,
      config.cache.proximity_px,
      Capabilities::default(),
    )
    .unwrap();

    let mut handlers: HashMap<String, Arc<dyn SyncHandler>> = HashMap::new();
    handlers.insert("cart-sync".to_string(), Arc::new(NoopSync));

    let views = BridgeViews::new(out.clone());
    let components = Components {
      reachability: ReachabilityMonitor::with_timing(true, Duration::ZERO, Duration::from_secs(4)),
      cache,
      scheduler: SyncScheduler::new(None, handlers),
      notifications: NotificationRouter::new(
        ORIGIN,
        config.notifications.clone(),
        Arc::new(views.clone()),
      )
      .unwrap(),
      install: InstallCoordinator::new(),
      actions: QuickActionRunner::new(Arc::new(OfflineStore), ORIGIN, false).unwrap(),
      views,
    };

    App::new(config, components, out)
  }

  async fn run_session(input: &'static str) -> Vec<HostCommand> {
    run_session_with(input, Capabilities::default()).await
  }

  async fn run_session_with(input: &'static str, capabilities: Capabilities) -> Vec<HostCommand> {
    let (out, mut rx) = HostOutput::channel();
    let mut app = app_with(out, capabilities);
    let events = EventHandler::with_reader(BufReader::new(input.as_bytes()), Duration::from_secs(3600));

    app.run(events).await.unwrap();
    drop(app);

    drain(&mut rx)
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<HostCommand>) -> Vec<HostCommand> {
    let mut commands = Vec::new();
    while let Ok(command) = rx.try_recv() {
      commands.push(command);
    }
    commands
  }

  #[tokio::test]
  async fn test_startup_announces_banner_and_preload() {
    let commands = run_session("").await;

    assert_eq!(
      commands[0],
      HostCommand::Banner {
        banner: Banner::Hidden
      }
    );
    assert!(commands.iter().any(|c| matches!(
      c,
      HostCommand::PreloadComplete(report) if report.stored == 1
    )));
  }

  #[tokio::test]
  async fn test_malformed_push_shows_one_fallback() {
    let commands = run_session("{\"type\":\"push\",\"payload\":\"{oops\"}\n").await;

    let shown: Vec<&HostCommand> = commands
      .iter()
      .filter(|c| matches!(c, HostCommand::ShowNotification(_)))
      .collect();
    assert_eq!(shown.len(), 1);
    match shown[0] {
      HostCommand::ShowNotification(request) => assert!(request.fallback),
      _ => unreachable!(),
    }
  }

  #[tokio::test]
  async fn test_quick_action_failure_becomes_error_toast() {
    let commands = run_session(
      "{\"type\":\"quick-action\",\"action\":\"add-to-cart\",\"product_id\":\"p1\"}\n",
    )
    .await;

    assert!(commands.contains(&HostCommand::ShowToast(Toast {
      id: 1,
      kind: ToastKind::Error,
      message: "Could not add to cart".to_string(),
    })));
  }

  #[tokio::test]
  async fn test_share_without_capability_copies_link() {
    let commands =
      run_session("{\"type\":\"quick-action\",\"action\":\"share\",\"product_id\":\"p1\"}\n").await;

    assert!(commands.contains(&HostCommand::CopyLink {
      url: format!("{}/products/p1", ORIGIN)
    }));
  }

  #[tokio::test]
  async fn test_install_prompt_without_offer_is_unavailable() {
    let commands = run_session("{\"type\":\"install-prompt-request\"}\n").await;

    assert!(commands.contains(&HostCommand::InstallResult {
      outcome: InstallOutcome::Unavailable
    }));
  }

  #[tokio::test]
  async fn test_periodic_wake_reports_result() {
    let commands = run_session(
      "{\"type\":\"periodic-sync\",\"tag\":\"cart-sync\"}\n{\"type\":\"periodic-sync\",\"tag\":\"nope\"}\n",
    )
    .await;

    assert!(commands.contains(&HostCommand::SyncResult(SyncReport {
      task: "cart-sync".to_string(),
      status: SyncStatus::Succeeded,
    })));
    assert!(commands.contains(&HostCommand::SyncResult(SyncReport {
      task: "nope".to_string(),
      status: SyncStatus::Unknown,
    })));
  }

  #[tokio::test]
  async fn test_reconnect_runs_sync_and_updates_banner() {
    let commands = run_session("{\"type\":\"offline\"}\n{\"type\":\"online\"}\n").await;

    let banners: Vec<Banner> = commands
      .iter()
      .filter_map(|c| match c {
        HostCommand::Banner { banner } => Some(*banner),
        _ => None,
      })
      .collect();
    assert_eq!(
      banners,
      vec![Banner::Hidden, Banner::Offline, Banner::BackOnline]
    );
    assert!(commands.contains(&HostCommand::SyncResult(SyncReport {
      task: "cart-sync".to_string(),
      status: SyncStatus::Succeeded,
    })));
  }

  #[tokio::test]
  async fn test_evict_reports_existing_namespace() {
    let commands = run_session("{\"type\":\"evict\",\"namespace\":\"api\"}\n").await;

    assert!(commands.contains(&HostCommand::Evicted {
      namespace: "api".to_string(),
      existed: true
    }));
  }

  #[tokio::test]
  async fn test_host_close_releases_pending_install_prompt() {
    let run = run_session(
      "{\"type\":\"before-install-prompt\",\"id\":\"o1\"}\n{\"type\":\"install-prompt-request\"}\n",
    );
    let commands = tokio::time::timeout(Duration::from_secs(3), run)
      .await
      .expect("run should return once the host is gone");

    assert!(commands.contains(&HostCommand::InstallResult {
      outcome: InstallOutcome::Dismissed
    }));
  }

  #[tokio::test]
  async fn test_install_prompt_capability_gates_offers() {
    let capabilities = Capabilities {
      install_prompt: false,
      ..Capabilities::default()
    };
    let commands = run_session_with(
      "{\"type\":\"before-install-prompt\",\"id\":\"o1\"}\n{\"type\":\"install-prompt-request\"}\n",
      capabilities,
    )
    .await;

    assert!(!commands.contains(&HostCommand::InstallAvailable { available: true }));
    assert!(!commands.contains(&HostCommand::ShowInstallPrompt {
      id: "o1".to_string()
    }));
    assert!(commands.contains(&HostCommand::InstallResult {
      outcome: InstallOutcome::Unavailable
    }));
  }

  #[tokio::test]
  async fn test_run_detaches_component_listeners_on_exit() {
    let (out, _rx) = HostOutput::channel();
    let mut app = app(out);
    let events = EventHandler::with_reader(BufReader::new("".as_bytes()), Duration::from_secs(3600));

    app.run(events).await.unwrap();

    assert_eq!(app.reachability.listener_count(), 0);
    assert_eq!(app.install.listener_count(), 0);
  }
}
