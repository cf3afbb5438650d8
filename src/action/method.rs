//! Routed method names

/// Every method the dispatcher routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Init,
    GetVersion,
    GetInitState,
    ForceGc,
    Shutdown,
    ValidateConfig,
    GetConfig,
    UpdateConfig,
    SetupConfig,
    GetProxies,
    ChangeProxy,
    GetTraffic,
    GetTotalTraffic,
    ResetTraffic,
    AsyncTestDelay,
    GetConnections,
    CloseConnections,
    ResetConnections,
    CloseConnection,
    GetExternalProviders,
    GetExternalProvider,
    UpdateGeoData,
    SideLoadExternalProvider,
    UpdateExternalProvider,
    GetCountryCode,
    GetMemory,
    StartLog,
    StopLog,
    StartMemory,
    StopMemory,
    StartConnections,
    StopConnections,
    StartListener,
    StopListener,
    UpdateDns,
    Suspend,
    Crash,
    DeleteFile,
}

// (method, canonical name, alias used by older hosts)
const NAMES: &[(Method, &str, &str)] = &[
    (Method::Init, "init", "initClash"),
    (Method::GetVersion, "get-version", "getVersion"),
    (Method::GetInitState, "get-init-state", "getIsInit"),
    (Method::ForceGc, "force-gc", "forceGc"),
    (Method::Shutdown, "shutdown", "shutdown"),
    (Method::ValidateConfig, "validate-config", "validateConfig"),
    (Method::GetConfig, "get-config", "getConfig"),
    (Method::UpdateConfig, "update-config", "updateConfig"),
    (Method::SetupConfig, "setup-config", "setupConfig"),
    (Method::GetProxies, "get-proxies", "getProxies"),
    (Method::ChangeProxy, "change-proxy", "changeProxy"),
    (Method::GetTraffic, "get-traffic", "getTraffic"),
    (Method::GetTotalTraffic, "get-total-traffic", "getTotalTraffic"),
    (Method::ResetTraffic, "reset-traffic", "resetTraffic"),
    (Method::AsyncTestDelay, "async-test-delay", "asyncTestDelay"),
    (Method::GetConnections, "get-connections", "getConnections"),
    (Method::CloseConnections, "close-connections", "closeConnections"),
    (Method::ResetConnections, "reset-connections", "resetConnections"),
    (Method::CloseConnection, "close-connection", "closeConnection"),
    (Method::GetExternalProviders, "get-external-providers", "getExternalProviders"),
    (Method::GetExternalProvider, "get-external-provider", "getExternalProvider"),
    (Method::UpdateGeoData, "update-geo-data", "updateGeoData"),
    (
        Method::SideLoadExternalProvider,
        "side-load-external-provider",
        "sideLoadExternalProvider",
    ),
    (Method::UpdateExternalProvider, "update-external-provider", "updateExternalProvider"),
    (Method::GetCountryCode, "get-country-code", "getCountryCode"),
    (Method::GetMemory, "get-memory", "getMemory"),
    (Method::StartLog, "start-log", "startLog"),
    (Method::StopLog, "stop-log", "stopLog"),
    (Method::StartMemory, "start-memory", "startMemory"),
    (Method::StopMemory, "stop-memory", "stopMemory"),
    (Method::StartConnections, "start-connections", "startConnections"),
    (Method::StopConnections, "stop-connections", "stopConnections"),
    (Method::StartListener, "start-listener", "startListener"),
    (Method::StopListener, "stop-listener", "stopListener"),
    (Method::UpdateDns, "update-dns", "updateDns"),
    (Method::Suspend, "suspend", "suspend"),
    (Method::Crash, "crash", "crash"),
    (Method::DeleteFile, "delete-file", "deleteFile"),
];

impl Method {
    /// Look up a method by its canonical name (any ASCII case) or its alias
    pub fn parse(name: &str) -> Option<Self> {
        NAMES
            .iter()
            .find(|(_, canonical, alias)| name.eq_ignore_ascii_case(canonical) || name == *alias)
            .map(|(method, _, _)| *method)
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(method, _, _)| *method == self)
            .map_or("", |(_, canonical, _)| *canonical)
    }

    pub fn all() -> impl Iterator<Item = Method> {
        NAMES.iter().map(|(method, _, _)| *method)
    }
}
