#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use kline_vwap::klcommon::api::{DEFAULT_ARCHIVE_URL, DEFAULT_REST_URL};
    use kline_vwap::klcommon::models::ArchiveKey;
    use kline_vwap::klcommon::{ArchiveSource, BybitApi, KlinePageSource, PageRequest, Resolution};

    fn api() -> BybitApi {
        BybitApi::new(DEFAULT_REST_URL.to_string(), DEFAULT_ARCHIVE_URL.to_string(), 30).unwrap()
    }

    #[tokio::test]
    #[ignore] // 需要访问Bybit公网接口
    async fn test_fetch_page_from_exchange() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
        let page = api()
            .fetch_page(&PageRequest {
                symbol: "BTCUSDT".to_string(),
                resolution: Resolution::M5,
                start,
                limit: 10,
            })
            .await
            .unwrap();

        assert!(!page.is_empty(), "应返回K线数据");
        for raw in &page {
            let candle = raw.to_candle().unwrap();
            assert!(candle.open_time >= start);
            assert!(Resolution::M5.is_aligned(candle.open_time));
        }
    }

    #[tokio::test]
    #[ignore] // 需要访问Bybit公网归档
    async fn test_download_monthly_archive() {
        let dir = tempfile::tempdir().unwrap();
        let key = ArchiveKey {
            symbol: "BTCUSDT".to_string(),
            resolution: Resolution::M5,
            year: 2023,
            month: 1,
        };
        let dest = dir.path().join(key.file_name());

        let found = api().download_archive(&key, &dest).await.unwrap();
        assert!(found, "2023年1月的归档应存在");
        assert!(std::fs::metadata(&dest).unwrap().len() > 0);

        let missing = ArchiveKey { year: 2001, ..key };
        assert!(!api().download_archive(&missing, &dir.path().join("missing.csv.gz")).await.unwrap());
    }
}
