use crate::config::SearchOptions;
use crate::error::SearchError;
use crate::language::resolve_language;
use crate::models::{
    BranchRankings, ChunkDisplay, ChunkKey, RankedChunk, SearchQuery, SearchResponse, SearchResult,
};
use crate::traits::{ChunkIndex, Embedder, RankingRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Semantic,
    Keyword,
}

#[derive(Debug)]
struct FusedHit {
    key: ChunkKey,
    display: ChunkDisplay,
    semantic_score: f64,
    keyword_score: f64,
}

impl FusedHit {
    fn combined(&self) -> f64 {
        self.semantic_score + self.keyword_score
    }
}

fn apply_rrf(target: &mut HashMap<ChunkKey, FusedHit>, hits: &[RankedChunk], branch: Branch, k: f64) {
    for (position, hit) in hits.iter().enumerate() {
        let rank_component = 1.0 / (k + (position as f64 + 1.0));
        let entry = target.entry(hit.key.clone()).or_insert_with(|| FusedHit {
            key: hit.key.clone(),
            display: hit.display.clone(),
            semantic_score: 0.0,
            keyword_score: 0.0,
        });
        match branch {
            Branch::Semantic => entry.semantic_score += rank_component,
            Branch::Keyword => entry.keyword_score += rank_component,
        }
    }
}

/// Reciprocal Rank Fusion of both branch rankings.
///
/// Results are sorted by combined score, highest first, with ties in ascending chunk identity order.
pub fn fuse(rankings: &BranchRankings, k: f64, top_n: usize) -> Vec<SearchResult> {
    let mut scored = HashMap::<ChunkKey, FusedHit>::new();
    apply_rrf(&mut scored, &rankings.semantic, Branch::Semantic, k);
    apply_rrf(&mut scored, &rankings.keyword, Branch::Keyword, k);

    let mut hits: Vec<FusedHit> = scored.into_values().collect();
    hits.sort_by(|left, right| {
        right
            .combined()
            .total_cmp(&left.combined())
            .then_with(|| left.key.cmp(&right.key))
    });

    hits.into_iter()
        .take(top_n)
        .map(|hit| SearchResult {
            combined_score: hit.combined(),
            vetrina_id: hit.key.vetrina_id,
            file_id: hit.key.file_id,
            page_number: hit.key.page_number,
            chunk_description: hit.key.description,
            semantic_score: hit.semantic_score,
            keyword_score: hit.keyword_score,
            display: hit.display,
        })
        .collect()
}

pub struct HybridSearchEngine<I: ChunkIndex> {
    index: I,
    embedder: Arc<dyn Embedder>,
    options: SearchOptions,
}

impl<I: ChunkIndex> HybridSearchEngine<I> {
    pub fn new(index: I, embedder: Arc<dyn Embedder>, options: SearchOptions) -> Self {
        Self {
            index,
            embedder,
            options,
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        let timeout = self.options.timeout;
        tokio::time::timeout(timeout, self.run(query))
            .await
            .map_err(|_| SearchError::Timeout(timeout))?
    }

    async fn run(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(SearchError::Validation("query is empty".to_string()));
        }
        query.filters.validate()?;
        self.options.validate()?;

        let language = resolve_language(text, query.filters.language.as_deref());

        let (query_vector, degraded) = match self.embedder.embed_text(text).await {
            Ok(vector) => (Some(vector), false),
            Err(error) if self.options.keyword_only_on_embedding_failure => {
                warn!(%error, "query embedding failed, answering from the keyword branch only");
                (None, true)
            }
            Err(error) => return Err(error.into()),
        };

        let request = RankingRequest {
            query_text: text,
            query_vector: query_vector.as_deref(),
            language,
            filters: &query.filters,
            semantic_limit: self.options.semantic_limit,
            keyword_limit: self.options.keyword_limit,
        };
        let rankings = self.index.rank_candidates(&request).await?;
        debug!(
            semantic = rankings.semantic.len(),
            keyword = rankings.keyword.len(),
            "branch rankings received"
        );

        let results = fuse(&rankings, self.options.k, self.options.top_n);
        info!(
            language = language.code(),
            degraded,
            results = results.len(),
            "search completed"
        );
        Ok(SearchResponse {
            query: text.to_string(),
            language,
            degraded,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::language::TextSearchLanguage;
    use crate::models::SearchFilters;
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::sync::Mutex;

    fn chunk(file_id: i64, page_number: u32, description: &str) -> RankedChunk {
        RankedChunk {
            key: ChunkKey {
                vetrina_id: 1,
                file_id,
                page_number,
                description: description.to_string(),
            },
            display: ChunkDisplay {
                vetrina_name: "Statistica".to_string(),
                author_username: "giulia".to_string(),
                course_name: "Statistica I".to_string(),
                file_name: format!("file-{file_id}.pdf"),
            },
        }
    }

    struct FixedIndex {
        rankings: BranchRankings,
        seen: Mutex<Vec<(TextSearchLanguage, bool)>>,
    }

    impl FixedIndex {
        fn new(rankings: BranchRankings) -> Self {
            Self {
                rankings,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChunkIndex for FixedIndex {
        async fn rank_candidates(
            &self,
            request: &RankingRequest<'_>,
        ) -> Result<BranchRankings, SearchError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.language, request.query_vector.is_some()));
            let mut rankings = self.rankings.clone();
            if request.query_vector.is_none() {
                rankings.semantic.clear();
            }
            Ok(rankings)
        }
    }

    struct StaticEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for StaticEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_text(&self, _text: &str) -> Result<Vec<f32>, CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::Unavailable("embedder".to_string()));
            }
            Ok(vec![1.0, 0.0])
        }

        async fn embed_image_text(
            &self,
            _image: &DynamicImage,
            text: &str,
        ) -> Result<Vec<f32>, CollaboratorError> {
            self.embed_text(text).await
        }
    }

    fn query(text: &str, language: Option<&str>) -> SearchQuery {
        SearchQuery {
            text: text.to_string(),
            filters: SearchFilters {
                language: language.map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn sample_rankings() -> BranchRankings {
        BranchRankings {
            semantic: vec![chunk(1, 1, "variance"), chunk(2, 1, "mean"), chunk(3, 2, "median")],
            keyword: vec![chunk(4, 1, "standard deviation"), chunk(5, 1, "quartiles"), chunk(1, 1, "variance")],
        }
    }

    #[test]
    fn scores_sum_reciprocal_ranks_across_branches() {
        let results = fuse(&sample_rankings(), 60.0, 10);
        let variance = results
            .iter()
            .find(|result| result.chunk_description == "variance")
            .unwrap();
        assert!((variance.semantic_score - 1.0 / 61.0).abs() < 1e-12);
        assert!((variance.keyword_score - 1.0 / 63.0).abs() < 1e-12);
        assert!((variance.combined_score - 0.032_266).abs() < 1e-5);
        assert_eq!(results[0].chunk_description, "variance");
    }

    #[test]
    fn agreement_between_branches_beats_either_branch_alone() {
        let results = fuse(&sample_rankings(), 60.0, 10);
        let top = &results[0];
        assert!(top.semantic_score > 0.0 && top.keyword_score > 0.0);
        assert!(results[1..]
            .iter()
            .all(|other| other.combined_score < top.combined_score));
    }

    #[test]
    fn ties_break_on_ascending_chunk_identity() {
        let rankings = BranchRankings {
            semantic: vec![chunk(9, 3, "late")],
            keyword: vec![chunk(2, 7, "early")],
        };
        let results = fuse(&rankings, 60.0, 10);
        assert_eq!(results[0].combined_score, results[1].combined_score);
        assert_eq!(results[0].file_id, 2);
        assert_eq!(results[1].file_id, 9);
    }

    #[test]
    fn fusion_truncates_to_top_n() {
        assert_eq!(fuse(&sample_rankings(), 60.0, 2).len(), 2);
    }

    #[tokio::test]
    async fn english_hint_yields_english_configuration_and_descending_scores() {
        let engine = HybridSearchEngine::new(
            FixedIndex::new(sample_rankings()),
            Arc::new(StaticEmbedder { fail: false }),
            SearchOptions::default(),
        );

        let response = engine
            .search(&query("variance explanation", Some("en")))
            .await
            .unwrap();

        assert_eq!(response.language, TextSearchLanguage::English);
        assert!(!response.degraded);
        assert_eq!(
            engine.index().seen.lock().unwrap().as_slice(),
            &[(TextSearchLanguage::English, true)]
        );
        assert_eq!(response.results.len(), 5);
        assert!(response
            .results
            .windows(2)
            .all(|pair| pair[0].combined_score > pair[1].combined_score
                || (pair[0].combined_score == pair[1].combined_score
                    && (pair[0].vetrina_id, pair[0].file_id) < (pair[1].vetrina_id, pair[1].file_id))));
        assert_eq!(response.results[0].display.author_username, "giulia");
    }

    #[tokio::test]
    async fn embedding_failure_fails_the_request_by_default() {
        let engine = HybridSearchEngine::new(
            FixedIndex::new(sample_rankings()),
            Arc::new(StaticEmbedder { fail: true }),
            SearchOptions::default(),
        );
        assert!(matches!(
            engine.search(&query("variance", None)).await,
            Err(SearchError::Collaborator(_))
        ));
        assert!(engine.index().seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn degrade_switch_answers_from_keywords_only() {
        let engine = HybridSearchEngine::new(
            FixedIndex::new(sample_rankings()),
            Arc::new(StaticEmbedder { fail: true }),
            SearchOptions {
                keyword_only_on_embedding_failure: true,
                ..Default::default()
            },
        );
        let response = engine.search(&query("variance", Some("it"))).await.unwrap();
        assert!(response.degraded);
        assert_eq!(response.language, TextSearchLanguage::Italian);
        assert!(response
            .results
            .iter()
            .all(|result| result.semantic_score == 0.0));
        assert_eq!(response.results.len(), 3);
    }

    #[tokio::test]
    async fn empty_queries_and_bad_filters_are_validation_errors() {
        let engine = HybridSearchEngine::new(
            FixedIndex::new(BranchRankings::default()),
            Arc::new(StaticEmbedder { fail: false }),
            SearchOptions::default(),
        );
        assert!(matches!(
            engine.search(&query("   ", None)).await,
            Err(SearchError::Validation(_))
        ));

        let mut bad = query("variance", None);
        bad.filters.course_year = Some(0);
        assert!(matches!(
            engine.search(&bad).await,
            Err(SearchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn negative_rrf_constant_is_rejected_before_ranking() {
        let engine = HybridSearchEngine::new(
            FixedIndex::new(sample_rankings()),
            Arc::new(StaticEmbedder { fail: false }),
            SearchOptions {
                k: -1.0,
                ..Default::default()
            },
        );
        assert!(matches!(
            engine.search(&query("variance", None)).await,
            Err(SearchError::Validation(_))
        ));
        assert!(engine.index().seen.lock().unwrap().is_empty());
    }
}
